//! Removal of transport- and storage-synthesized property keys before
//! properties are compared or copied between stores.

use storage::{ContentProperties, PROP_CHECKSUM, PROP_MODIFIED, PROP_SIZE};

/// Keys that say something about how content was stored or transported
/// rather than what it is. Providers re-synthesize them on write, so they
/// must not participate in drift comparison or be copied across stores.
const CLEANED_KEYS: &[&str] = &[
    "content-md5",
    PROP_CHECKSUM,
    PROP_MODIFIED,
    PROP_SIZE,
    "Content-Length",
    "Content-Type",
    "Last-Modified",
    "Date",
    "ETag",
    "content-length",
    "content-type",
    "last-modified",
    "date",
    "etag",
];

/// A copy of `props` with every transport/storage-synthesized key removed.
pub fn clean(props: &ContentProperties) -> ContentProperties {
    props
        .iter()
        .filter(|(key, _)| !CLEANED_KEYS.contains(key))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_synthesized_and_http_keys() {
        let mut props = ContentProperties::new();
        props.insert(PROP_CHECKSUM, "abc");
        props.insert("content-md5", "abc");
        props.insert(PROP_SIZE, "5");
        props.insert("Content-Type", "text/plain");
        props.insert("etag", "\"abc\"");
        props.insert("content-mimetype", "text/plain");
        props.insert("color", "blue");

        let cleaned = clean(&props);
        assert_eq!(
            cleaned,
            [("content-mimetype", "text/plain"), ("color", "blue")]
                .into_iter()
                .collect()
        );
    }

    #[test]
    fn drift_comparison_ignores_checksums() {
        let mut a = ContentProperties::new();
        a.insert(PROP_CHECKSUM, "one");
        a.insert("owner", "ops");

        let mut b = ContentProperties::new();
        b.insert(PROP_CHECKSUM, "two");
        b.insert("owner", "ops");

        assert_ne!(a, b);
        assert_eq!(clean(&a), clean(&b));
    }
}

pub mod produce;
pub mod work;

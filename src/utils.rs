mod any_key;
pub mod timer;

pub(crate) use any_key::AnyKey;

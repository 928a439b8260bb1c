pub mod async_utils;
pub mod document_store;
pub mod key_value_store;
pub mod priority;
pub mod quantity;

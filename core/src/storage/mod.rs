pub mod object_store;
pub mod s3_object_store;
pub mod storage_ref;
pub mod storage_resolver;

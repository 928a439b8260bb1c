pub mod seed_file_repository;
pub mod workflow;
pub mod workflow_repository;

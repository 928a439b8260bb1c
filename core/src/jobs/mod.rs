pub mod background_job;
pub mod background_job_repository;
pub mod background_jobs;
pub mod cron_materializer;

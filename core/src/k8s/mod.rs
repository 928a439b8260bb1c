pub mod crawl_job_client;

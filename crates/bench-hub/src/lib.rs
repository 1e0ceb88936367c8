mod client;
mod fetch;
mod tasks;

pub use client::{parse_rows_page, resolve_retry_settings_from_env, HubClient, RetrySettings};
pub use fetch::{
    fetch_context_files, list_context_dir, verify_context_files, ContentSource,
    ContextFetchConfig, FetchError,
};
pub use tasks::{check_task_count, load_tasks_file};

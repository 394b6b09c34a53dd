mod common;

mod action_agent;
mod idle_watcher;
mod store_accounts;
mod store_feedback;
mod store_messages;
mod store_queue;
mod sync_engine;

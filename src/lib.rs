//! Core of a self-hosted anti-spam engine for group-chat platforms: the
//! multi-signal Detector, its sample/dictionary stores, the locator, the
//! approved-users cache, rate-limiting terminators and the pipeline that
//! wires them to a platform adapter. The platform client, the HTTP admin
//! surface, the CLI, and the external LLM/reputation endpoints are out of
//! scope for this crate and are represented only as traits in `adapters`.

pub mod adapters;
pub mod approved_users;
pub mod classifier;
pub mod config;
pub mod crypto;
pub mod db;
pub mod detected_spam;
pub mod detector;
pub mod dictionary;
pub mod error;
pub mod locator;
pub mod model;
pub mod pipeline;
pub mod samples;
pub mod settings_store;
pub mod terminator;
pub mod tokenizer;
pub mod watcher;

#[cfg(debug_assertions)]
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .pretty()
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("foxglove=trace".parse().unwrap()),
        )
        .init();
}

#[cfg(not(debug_assertions))]
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .json()
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
}

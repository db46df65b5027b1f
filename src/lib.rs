//! Invoice agent: classifies email attachments and uploads as invoices or
//! other documents and files them into managed storage.

pub mod api;
pub mod config;
pub mod error;
pub mod extract;
pub mod llm;
pub mod mailbox;
pub mod pipeline;
pub mod security;
pub mod storage;

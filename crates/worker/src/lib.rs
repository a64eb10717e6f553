//! Process wiring for the sync worker: storage selection, ERP adapter and
//! scheduler lifecycle.

pub mod app;

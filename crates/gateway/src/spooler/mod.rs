//! Spool workers: background drains of the mail and REST queue tables. Each
//! worker is the sole consumer of its table and deletes or stamps every row
//! it processes; both run on the cluster master only.

pub mod mail;
pub mod rest;

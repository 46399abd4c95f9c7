//! HTTP model serving service built on `serving-core`.

pub mod http;

//! httpstitch - HTTP transaction reconstruction
//!
//! Core library turning the two reassembled half-streams of a TCP
//! connection into paired HTTP request/response events.

pub mod capture;
pub mod config;
pub mod http;
pub mod sink;
pub mod stream;

//! Integration tests for harvest-engine

mod engine_tests;
mod http_tests;

//! Test fixtures shared by the integration tests: an in-memory service registry and
//! servers that an [`mirto::App`] can drive.

pub mod registry;
pub mod test_server;

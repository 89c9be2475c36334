//! Integration tests: the probe end to end against in-memory collaborators.

mod mock_api;
mod probe_flow;

/*!
# Vigil DevKit - Tooling for Wire-Protocol Development

Utilities for developing and testing against a running Vigil host:
- Scripted agent speaking the newline-delimited JSON wire protocol
- Polling assertion helpers for integration tests
*/

pub mod harness;
pub mod stub_agent;

pub use harness::{init_test_logging, wait_for};
pub use stub_agent::ScriptedAgent;

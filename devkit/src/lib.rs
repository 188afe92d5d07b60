/*!
# virtsync DevKit - test doubles

- stub discovery agent speaking the framed protocol over TCP
- in-memory monitoring registry with failure injection
- harness and payload builders for full reconciliation runs
*/

pub mod agent_stub;
pub mod registry_stub;
pub mod test_utils;

pub use agent_stub::{ReplyMode, StubAgent};
pub use registry_stub::{MockRegistry, StoredHost};
pub use test_utils::{rule, type_section, DiscoveryBuilder, TestHarness};

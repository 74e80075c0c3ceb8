/*!
# depsync DevKit - fakes and an in-process cluster

Helps test the coordination protocol without a broker or real package managers:
- `FakeManager`: scripted pip/npm stand-in that records every call
- `ClusterHarness`: master plus N agents wired over a `MemoryHub`
*/

pub mod fakes;
pub mod harness;

pub use fakes::{FakeCall, FakeManager};
pub use harness::{init_tracing, wait_until, ClusterHarness, MASTER_KEY};

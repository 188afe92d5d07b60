/*!
# virtsync core

Keeps a monitoring registry in step with the objects a virtualization
discovery agent reports: creates hosts for new VMs, hypervisors and
datastores, and deletes, disables or only reports hosts whose object is gone.

- `protocol`: framed key/value exchange with the agent
- `rules`: inclusion, exclusion and optional rules on live attributes
- `registry`: port to the monitoring registry
- `reconcile`: the per-type pass
- `engine`: the run over every configured type
*/

pub mod config;
pub mod engine;
pub mod error;
pub mod inventory;
pub mod model;
pub mod protocol;
pub mod reconcile;
pub mod registry;
pub mod report;
pub mod rules;

pub use config::{Config, ObjectTypeConfig};
pub use engine::Engine;
pub use error::{ConfigError, SyncError, SyncResult};
pub use model::{DiscoveredObject, HostCandidate, HostStatus, ManagedHost, ObjectType};
pub use protocol::{AgentClient, AgentQuery, ProtocolError};
pub use reconcile::{PassAborted, RemovalAction, RunContext};
pub use registry::{Registry, RegistryError};
pub use report::{SyncOutcome, TypeOutcome};

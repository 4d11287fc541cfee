// 🛡️ Everything that touches processes, files or the network lives under sys/,
// behind the contracts in traits.rs.

pub mod traits;        // Global contracts
pub mod secrets;       // Memory hygiene (ProviderCredential)
pub mod job;           // Job data model
pub mod backend;       // CI backend normalization + step outputs
pub mod scanner;       // Scanner container execution
pub mod artifact;      // Retention policy + manifest
pub mod static_server; // Loopback nginx container
pub mod tunnel;        // ngrok reverse tunnel
pub mod publish;       // Server + tunnel lifecycle
pub mod shutdown;      // Termination signals

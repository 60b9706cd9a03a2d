pub mod controller;
pub mod model;

pub use controller::{ModelView, SessionController};
pub use model::{ConnectionSnapshot, ModelSnapshot, SessionModel};

// Session control: one SessionModel per workspace holding that workspace's
// open connections and master-publishing state, orchestrated by a single
// SessionController that is the only writer of both model state and the
// process-wide server registry.

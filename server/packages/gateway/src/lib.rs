//! Render gateway: installs application packages, launches rendering
//! runtimes on demand and keeps them alive while viewers are attached.

pub mod cli;
pub mod packages;
pub mod prober;
pub mod router;
pub mod session_manager;
pub mod supervisor;

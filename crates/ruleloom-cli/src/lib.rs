//! Command line front end for ruleloom rule files
//!
//! Runs rule books against a console subject so admins can try rules
//! without a game server.

pub mod commands;
pub mod console;
pub mod logging;
pub mod vars;

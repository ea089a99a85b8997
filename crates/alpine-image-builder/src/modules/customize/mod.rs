//! Edits applied to the provisioned root, in a fixed order. Every step can be
//! re-run against its own output.

use alpine_image_builder_macros::Module;

use crate::modules::ModuleToggle;

pub mod identity;
pub mod packages;
pub mod services;
pub mod sshd;
pub mod symlinks;
pub mod timezone;

pub use identity::IdentityTask;
pub use packages::{PackagesTask, PruneTask, UpgradeTask};
pub use services::ServicesTask;
pub use sshd::SshdTask;
pub use symlinks::SymlinksTask;
pub use timezone::TimezoneTask;

#[Module(
    id = "customize",
    config = ModuleToggle,
    config_path = "customize",
    tasks = [
        TimezoneTask,
        PackagesTask,
        PruneTask,
        UpgradeTask,
        SshdTask,
        ServicesTask,
        SymlinksTask,
        IdentityTask
    ]
)]
pub struct CustomizeModule;

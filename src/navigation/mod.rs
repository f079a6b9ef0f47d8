//! Soft navigation: link clicks and history steps turned into in-place
//! content swaps with entry and exit animations.

mod controller;
mod hooks;
mod visit;

pub use self::controller::{NAVIGATING, NavigationController};
pub use self::hooks::{Hook, HookContext};
pub use self::visit::{Trigger, Visit, VisitOutcome, VisitPhase, VisitReport, VisitRequest};

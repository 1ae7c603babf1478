//! Portal components built on the engine
//!
//! Each component runs as its own task on the page and fails on its own: a
//! broken assignment flow leaves tab titles and the lookup menu working.

pub mod case_assignment;
pub mod context_menu;
pub mod tab_title;

pub use case_assignment::{CaseAssignment, CaseAssignmentConfig, abbreviate_name};
pub use context_menu::{
    ContextMenu, ContextMenuConfig, Indicator, IndicatorClassifier, LookupUrls, MenuAction,
    PatternClassifier, TemplateLookups,
};
pub use tab_title::{PageKind, PortalPage, TabTitle, TabTitleConfig};

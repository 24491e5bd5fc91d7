pub use super::{FamilyConfig, MetricFamily};

pub use crate::errors::*;
pub use crate::memo::Memoized;
pub use crate::monitor::{Family, Monitor};
pub use crate::task::{TaskSlot, run_task};
pub use crate::util;
pub use crate::wrappers::{Seconds, SerdeRegex, ShellString};

pub use serde::Deserialize;
pub use serde_json::Value;

pub use std::cell::{Cell, RefCell};
pub use std::collections::HashMap;
pub use std::rc::Rc;
pub use std::time::{Duration, Instant};

pub use smart_default::SmartDefault;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thread_priority::{ThreadPriority, ThreadPriorityValue};

/// Portable scheduling priority for worker threads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Idle,
    Lowest,
    Low,
    #[default]
    Normal,
    High,
    Highest,
    Realtime,
}

impl Priority {
    pub const ALL: [Priority; 7] = [
        Priority::Idle,
        Priority::Lowest,
        Priority::Low,
        Priority::Normal,
        Priority::High,
        Priority::Highest,
        Priority::Realtime,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Priority::Idle => "idle",
            Priority::Lowest => "lowest",
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Highest => "highest",
            Priority::Realtime => "realtime",
        }
    }

    fn native(self) -> Option<ThreadPriority> {
        let level = match self {
            Priority::Idle => return Some(ThreadPriority::Min),
            Priority::Realtime => return Some(ThreadPriority::Max),
            Priority::Normal => return None,
            Priority::Lowest => 10,
            Priority::Low => 30,
            Priority::High => 70,
            Priority::Highest => 90,
        };
        ThreadPriorityValue::try_from(level)
            .ok()
            .map(ThreadPriority::Crossplatform)
    }

    /// Applies this priority to the calling thread.
    ///
    /// Best effort: returns `false` when the platform refuses, which is common for raised
    /// priorities without the right privileges.
    pub fn apply_current(self) -> bool {
        let Some(native) = self.native() else {
            return true;
        };
        match thread_priority::set_current_thread_priority(native) {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(priority = ?self, error = ?e, "thread priority not applied");
                false
            }
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Priority::ALL
            .into_iter()
            .find(|p| p.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown priority: {s}"))
    }
}

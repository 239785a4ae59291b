use std::fmt;

/// How far a failure reaches.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// One plugin call or fetch failed; log it and keep going.
    ItemLocal,
    /// A bounded resource ran out; retry with backoff, then fail the item.
    ResourceExhaustion,
    /// The stage cannot make progress anymore.
    StageFatal,
}

impl ErrorClass {
    pub fn is_retryable(self) -> bool {
        self == ErrorClass::ResourceExhaustion
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ErrorClass::ItemLocal => "item-local",
            ErrorClass::ResourceExhaustion => "resource-exhaustion",
            ErrorClass::StageFatal => "stage-fatal",
        })
    }
}

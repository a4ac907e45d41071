use std::fmt;

use serde::{Deserialize, Serialize};

/// The states of the build pipeline.
///
/// Each job flows through:
/// UPLOADED → UNPACKING → UNPACKED → SEASHELLING → SEASHELLED → HLSING → HLSED
/// → SYNTHING → SYNTHED, or drops into FAILED from any transient state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum State {
    Uploaded,
    Unpacking,
    Unpacked,
    Seashelling,
    Seashelled,
    Hlsing,
    Hlsed,
    Synthing,
    Synthed,
    Failed,
}

impl State {
    pub fn is_terminal(self) -> bool {
        matches!(self, State::Synthed | State::Failed)
    }

    /// Whether the store may move a job from `self` to `next`.
    ///
    /// Only three moves exist: a stage's old state to its transient state
    /// (acquire), and a transient state to either its done state or `Failed`
    /// (commit).
    pub fn can_transition_to(self, next: State) -> bool {
        Stage::ALL.iter().any(|s| {
            (self == s.old() && next == s.transient())
                || (self == s.transient() && (next == s.done() || next == State::Failed))
        })
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            State::Uploaded => "uploaded",
            State::Unpacking => "unpacking",
            State::Unpacked => "unpacked",
            State::Seashelling => "seashelling",
            State::Seashelled => "seashelled",
            State::Hlsing => "hlsing",
            State::Hlsed => "hlsed",
            State::Synthing => "synthing",
            State::Synthed => "synthed",
            State::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// One pipeline step, owning an (old, transient, done) state triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Unpack,
    Seashell,
    Hls,
    Synth,
}

impl Stage {
    /// Every stage, in pipeline order.
    pub const ALL: [Stage; 4] = [Stage::Unpack, Stage::Seashell, Stage::Hls, Stage::Synth];

    pub fn old(self) -> State {
        self.triple().0
    }

    pub fn transient(self) -> State {
        self.triple().1
    }

    pub fn done(self) -> State {
        self.triple().2
    }

    pub fn triple(self) -> (State, State, State) {
        match self {
            Stage::Unpack => (State::Uploaded, State::Unpacking, State::Unpacked),
            Stage::Seashell => (State::Unpacked, State::Seashelling, State::Seashelled),
            Stage::Hls => (State::Seashelled, State::Hlsing, State::Hlsed),
            Stage::Synth => (State::Hlsed, State::Synthing, State::Synthed),
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Unpack => write!(f, "unpack"),
            Stage::Seashell => write!(f, "seashell"),
            Stage::Hls => write!(f, "hls"),
            Stage::Synth => write!(f, "synth"),
        }
    }
}

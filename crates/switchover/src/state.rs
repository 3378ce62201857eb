/// State of one node's participation in a switchover.
#[derive(
    Debug,
    Default,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    strum::Display,
    strum::EnumString,
    strum::IntoStaticStr,
)]
#[strum(serialize_all = "kebab-case")]
pub enum State {
    #[default]
    Starting,
    Ready,
    Armed,
    ArmWait,
    Pausing,
    Paused,
    PauseWait,
    Complete,
    Abort,
}

impl State {
    /// Active states are those between arming and completion,
    /// which are bounded by a deadline.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            State::Armed | State::ArmWait | State::Pausing | State::Paused | State::PauseWait
        )
    }

    pub fn into_str(self) -> &'static str {
        self.into()
    }

    pub(crate) fn one_of(self, states: &[State]) -> bool {
        states.contains(&self)
    }
}

#[derive(Clone, PartialEq, Eq, Debug, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
/// Config values for [`Group`](crate::Group).
pub struct GroupConfig {
    /// Whether the leader re-raises a panic from the operation on its own task
    /// once the joiners have been released with [`Error::Panicked`](crate::Error::Panicked)
    pub propagate_panics: bool,
}

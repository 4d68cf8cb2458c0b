use crate::step::BRANCH_ERROR_PREFIX;

/// The branch that won a race: its serialized result and its position in
/// the branch list.
#[derive(Debug, Clone)]
pub struct RaceResult {
    pub value: String,
    pub index: usize,
}

/// First gathered slot holding a real result. Failure reports never win.
pub(crate) fn find_winner(slots: &[Option<String>]) -> Option<RaceResult> {
    slots.iter().enumerate().find_map(|(index, slot)| match slot {
        Some(value) if !value.starts_with(BRANCH_ERROR_PREFIX) => Some(RaceResult {
            value: value.clone(),
            index,
        }),
        _ => None,
    })
}

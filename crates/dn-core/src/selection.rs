use alloy_primitives::Address;
use dn_types::CharityEntity;

/// Keeps the chosen charity pointing at a member of the latest charity set.
///
/// Addresses are compared as 20-byte values, so checksum casing never
/// affects membership.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectionReconciler {
    selected: Option<Address>,
}

impl SelectionReconciler {
    pub fn selected(&self) -> Option<Address> {
        self.selected
    }

    /// Re-targets the selection after the charity set was replaced. Returns
    /// the resulting selection, which is `None` only when `entities` is empty.
    pub fn reconcile(&mut self, entities: &[CharityEntity]) -> Option<Address> {
        let still_present = self
            .selected
            .is_some_and(|selected| entities.iter().any(|entity| entity.address == selected));

        if !still_present {
            self.selected = entities.first().map(|entity| entity.address);
        }
        self.selected
    }

    /// Selects `address` if it belongs to `entities`.
    pub fn select(&mut self, address: Address, entities: &[CharityEntity]) -> bool {
        if entities.iter().any(|entity| entity.address == address) {
            self.selected = Some(address);
            true
        } else {
            false
        }
    }

    pub fn clear(&mut self) {
        self.selected = None;
    }
}

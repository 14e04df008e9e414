use serde::{Deserialize, Serialize};

/// Number of analog inputs a device exposes.
pub const MAX_CHANNEL_COUNT: usize = 8;

/// Named input slots; an empty name marks an unused slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelLayout {
    slots: Vec<String>,
}

impl ChannelLayout {
    /// Build from slot names in device order. Slots past the eighth are ignored
    /// by `mask`, so callers validate with `overflow` first.
    pub fn new<S: AsRef<str>>(names: &[S]) -> Self {
        Self {
            slots: names.iter().map(|n| n.as_ref().trim().to_string()).collect(),
        }
    }

    /// Names of the used slots, in slot order.
    pub fn header(&self) -> Vec<String> {
        self.slots.iter().filter(|n| !n.is_empty()).cloned().collect()
    }

    /// Bit i is set when slot i is used.
    pub fn mask(&self) -> u8 {
        self.slots
            .iter()
            .take(MAX_CHANNEL_COUNT)
            .enumerate()
            .filter(|(_, name)| !name.is_empty())
            .fold(0u8, |mask, (idx, _)| mask | (1 << idx))
    }

    pub fn count(&self) -> usize {
        self.slots.iter().filter(|n| !n.is_empty()).count()
    }

    /// True when more slots were configured than the device has.
    pub fn overflow(&self) -> bool {
        self.slots.len() > MAX_CHANNEL_COUNT
    }
}

impl Default for ChannelLayout {
    fn default() -> Self {
        Self::new(&["ecg", "eda", "bvp"])
    }
}

/// Count of active channels encoded in a mask.
pub fn channels_in_mask(mask: u8) -> usize {
    mask.count_ones() as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_skips_unused_slots() {
        let layout = ChannelLayout::new(&["ecg", "", "bvp", "", "", "", "", "resp"]);
        assert_eq!(layout.header(), vec!["ecg", "bvp", "resp"]);
        assert_eq!(layout.mask(), 0b1000_0101);
        assert_eq!(layout.count(), 3);
        assert_eq!(channels_in_mask(layout.mask()), 3);
        assert!(!layout.overflow());
    }

    #[test]
    fn default_layout_uses_first_three_slots() {
        let layout = ChannelLayout::default();
        assert_eq!(layout.mask(), 0x07);
    }
}

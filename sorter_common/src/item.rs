//! Item, category, and drop-reason model.
//!
//! An item is created on a trigger edge and is terminal once actuated,
//! dropped, or failed. Items flow by value through channels; no stage
//! holds a reference to an item after handing it on.

use serde::{Deserialize, Serialize};

/// Monotonic item identifier, assigned at trigger time.
pub type ItemId = u64;

/// Canonical material category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum Category {
    Metal = 0,
    Plastic = 1,
    Glass = 2,
    Carton = 3,
    Other = 4,
}

/// Number of canonical categories.
pub const CATEGORY_COUNT: usize = 5;

impl Category {
    /// All categories in discriminant order.
    pub const ALL: [Category; CATEGORY_COUNT] = [
        Category::Metal,
        Category::Plastic,
        Category::Glass,
        Category::Carton,
        Category::Other,
    ];

    /// Convert from raw `u8`. Returns `None` for invalid values.
    #[inline]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Metal),
            1 => Some(Self::Plastic),
            2 => Some(Self::Glass),
            3 => Some(Self::Carton),
            4 => Some(Self::Other),
            _ => None,
        }
    }

    /// Parse a canonical lowercase name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "metal" => Some(Self::Metal),
            "plastic" => Some(Self::Plastic),
            "glass" => Some(Self::Glass),
            "carton" => Some(Self::Carton),
            "other" => Some(Self::Other),
            _ => None,
        }
    }

    /// Canonical lowercase name.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Metal => "metal",
            Self::Plastic => "plastic",
            Self::Glass => "glass",
            Self::Carton => "carton",
            Self::Other => "other",
        }
    }

    /// Array index for per-category fixed-size state.
    #[inline]
    pub const fn idx(&self) -> usize {
        *self as usize
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Axis-aligned bounding box from the classifier, in frame pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
}

/// Result of classifying one frame, after alias mapping and the
/// confidence gate have been applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub category: Category,
    /// Confidence in `0..=1`.
    pub confidence: f64,
    pub bbox: Option<BoundingBox>,
    /// True when the confidence gate substituted the fallback category.
    pub fallback_applied: bool,
}

/// Why an item was not actuated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum DropReason {
    /// Classification finished after the fire deadline passed.
    Late = 0,
    /// Destination bin at or above the full threshold.
    BinFull = 1,
    /// Serialization offset pushed the fire past its latest acceptable time.
    Congested = 2,
    /// Belt not running or speed not positive at scheduling time.
    BeltNotReady = 3,
    /// Fallback-category item with no diverter configured; passed through.
    LowConfidence = 4,
    /// Classifier returned an error for this frame.
    ClassifierError = 5,
}

/// Number of drop reasons, for per-reason counters.
pub const DROP_REASON_COUNT: usize = 6;

impl DropReason {
    pub const ALL: [DropReason; DROP_REASON_COUNT] = [
        DropReason::Late,
        DropReason::BinFull,
        DropReason::Congested,
        DropReason::BeltNotReady,
        DropReason::LowConfidence,
        DropReason::ClassifierError,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Late => "LATE",
            Self::BinFull => "BIN_FULL",
            Self::Congested => "CONGESTED",
            Self::BeltNotReady => "BELT_NOT_READY",
            Self::LowConfidence => "LOW_CONFIDENCE",
            Self::ClassifierError => "CLASSIFIER_ERROR",
        }
    }

    #[inline]
    pub const fn idx(&self) -> usize {
        *self as usize
    }
}

impl std::fmt::Display for DropReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal outcome of an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ItemOutcome {
    /// Diverter pulse fired on time.
    Delivered,
    /// Not actuated; reason recorded.
    Dropped(DropReason),
    /// Actuation was attempted and the hardware reported a fault.
    Failed,
}

/// One detected item, from trigger edge to terminal outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub id: ItemId,
    /// Monotonic trigger timestamp [ns].
    pub trigger_ts_ns: u64,
    /// Opaque frame handle; the camera driver owns the pixels.
    pub image_ref: u64,
    pub classification: Option<Classification>,
    /// Monotonic timestamp the classifier returned [ns].
    pub classify_ts_ns: Option<u64>,
    /// Scheduled fire time [ns], set once the dispatch decision is made.
    pub fire_deadline_ns: Option<u64>,
    pub actuated: bool,
    pub outcome: Option<ItemOutcome>,
}

impl Item {
    /// New item at a trigger edge.
    pub fn triggered(id: ItemId, trigger_ts_ns: u64, image_ref: u64) -> Self {
        Self {
            id,
            trigger_ts_ns,
            image_ref,
            classification: None,
            classify_ts_ns: None,
            fire_deadline_ns: None,
            actuated: false,
            outcome: None,
        }
    }

    #[inline]
    pub fn is_terminal(&self) -> bool {
        self.outcome.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_roundtrip() {
        for v in 0..=4u8 {
            let cat = Category::from_u8(v).unwrap();
            assert_eq!(cat as u8, v);
            assert_eq!(Category::from_name(cat.as_str()), Some(cat));
        }
        assert!(Category::from_u8(5).is_none());
        assert!(Category::from_name("cardboard").is_none());
    }

    #[test]
    fn category_all_covers_every_index() {
        for (i, cat) in Category::ALL.iter().enumerate() {
            assert_eq!(cat.idx(), i);
        }
    }

    #[test]
    fn drop_reason_names() {
        assert_eq!(DropReason::Late.as_str(), "LATE");
        assert_eq!(DropReason::BeltNotReady.as_str(), "BELT_NOT_READY");
        for (i, reason) in DropReason::ALL.iter().enumerate() {
            assert_eq!(reason.idx(), i);
        }
    }

    #[test]
    fn item_lifecycle_flags() {
        let mut item = Item::triggered(7, 1_000, 7);
        assert!(!item.is_terminal());
        item.outcome = Some(ItemOutcome::Dropped(DropReason::Late));
        assert!(item.is_terminal());
    }
}

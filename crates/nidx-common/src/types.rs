//! Value groups and their fixed ordering.

use serde::{Deserialize, Serialize};

/// Category of an indexable value.
///
/// The declaration order is the cross-category sort order used by the index:
/// every array group sorts before every scalar group, and within each half
/// spatial sorts first and numbers last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ValueGroup {
    GeometryArray = 0,
    ZonedDateTimeArray = 1,
    LocalDateTimeArray = 2,
    DateArray = 3,
    ZonedTimeArray = 4,
    LocalTimeArray = 5,
    DurationArray = 6,
    TextArray = 7,
    BooleanArray = 8,
    NumberArray = 9,
    Geometry = 10,
    ZonedDateTime = 11,
    LocalDateTime = 12,
    Date = 13,
    ZonedTime = 14,
    LocalTime = 15,
    Duration = 16,
    Text = 17,
    Boolean = 18,
    Number = 19,
}

impl ValueGroup {
    /// All groups in sort order.
    pub const ALL: [ValueGroup; 20] = [
        ValueGroup::GeometryArray,
        ValueGroup::ZonedDateTimeArray,
        ValueGroup::LocalDateTimeArray,
        ValueGroup::DateArray,
        ValueGroup::ZonedTimeArray,
        ValueGroup::LocalTimeArray,
        ValueGroup::DurationArray,
        ValueGroup::TextArray,
        ValueGroup::BooleanArray,
        ValueGroup::NumberArray,
        ValueGroup::Geometry,
        ValueGroup::ZonedDateTime,
        ValueGroup::LocalDateTime,
        ValueGroup::Date,
        ValueGroup::ZonedTime,
        ValueGroup::LocalTime,
        ValueGroup::Duration,
        ValueGroup::Text,
        ValueGroup::Boolean,
        ValueGroup::Number,
    ];

    /// Number of array groups; array groups occupy ids `0..ARRAY_GROUPS`.
    const ARRAY_GROUPS: u8 = 10;

    /// Returns true for array groups.
    pub fn is_array(&self) -> bool {
        (*self as u8) < Self::ARRAY_GROUPS
    }

    /// Returns the array group holding elements of this scalar group.
    pub fn array_of(&self) -> Option<ValueGroup> {
        if self.is_array() {
            return None;
        }
        Self::from_id(*self as u8 - Self::ARRAY_GROUPS)
    }

    /// Returns the scalar group of elements in this array group.
    pub fn element_group(&self) -> Option<ValueGroup> {
        if !self.is_array() {
            return None;
        }
        Self::from_id(*self as u8 + Self::ARRAY_GROUPS)
    }

    /// Returns the group for a persisted id.
    pub fn from_id(id: u8) -> Option<ValueGroup> {
        Self::ALL.get(id as usize).copied()
    }

    /// Returns true for the temporal groups (scalar or array).
    pub fn is_temporal(&self) -> bool {
        let scalar = self.element_group().unwrap_or(*self);
        matches!(
            scalar,
            ValueGroup::ZonedDateTime
                | ValueGroup::LocalDateTime
                | ValueGroup::Date
                | ValueGroup::ZonedTime
                | ValueGroup::LocalTime
                | ValueGroup::Duration
        )
    }
}

impl std::fmt::Display for ValueGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ValueGroup::GeometryArray => "GEOMETRY_ARRAY",
            ValueGroup::ZonedDateTimeArray => "ZONED_DATE_TIME_ARRAY",
            ValueGroup::LocalDateTimeArray => "LOCAL_DATE_TIME_ARRAY",
            ValueGroup::DateArray => "DATE_ARRAY",
            ValueGroup::ZonedTimeArray => "ZONED_TIME_ARRAY",
            ValueGroup::LocalTimeArray => "LOCAL_TIME_ARRAY",
            ValueGroup::DurationArray => "DURATION_ARRAY",
            ValueGroup::TextArray => "TEXT_ARRAY",
            ValueGroup::BooleanArray => "BOOLEAN_ARRAY",
            ValueGroup::NumberArray => "NUMBER_ARRAY",
            ValueGroup::Geometry => "GEOMETRY",
            ValueGroup::ZonedDateTime => "ZONED_DATE_TIME",
            ValueGroup::LocalDateTime => "LOCAL_DATE_TIME",
            ValueGroup::Date => "DATE",
            ValueGroup::ZonedTime => "ZONED_TIME",
            ValueGroup::LocalTime => "LOCAL_TIME",
            ValueGroup::Duration => "DURATION",
            ValueGroup::Text => "TEXT",
            ValueGroup::Boolean => "BOOLEAN",
            ValueGroup::Number => "NUMBER",
        };
        write!(f, "{}", name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_match_positions() {
        for (i, group) in ValueGroup::ALL.iter().enumerate() {
            assert_eq!(*group as usize, i);
            assert_eq!(ValueGroup::from_id(i as u8), Some(*group));
        }
        assert_eq!(ValueGroup::from_id(20), None);
    }

    #[test]
    fn test_arrays_sort_before_scalars() {
        assert!(ValueGroup::NumberArray < ValueGroup::Geometry);
        assert!(ValueGroup::GeometryArray < ValueGroup::TextArray);
        assert!(ValueGroup::Text < ValueGroup::Number);
        assert!(ValueGroup::Boolean < ValueGroup::Number);
    }

    #[test]
    fn test_array_element_mapping() {
        for group in ValueGroup::ALL {
            if group.is_array() {
                let element = group.element_group().unwrap();
                assert!(!element.is_array());
                assert_eq!(element.array_of(), Some(group));
            } else {
                assert_eq!(group.element_group(), None);
                assert!(group.array_of().is_some());
            }
        }
        assert_eq!(ValueGroup::Text.array_of(), Some(ValueGroup::TextArray));
    }

    #[test]
    fn test_is_temporal() {
        assert!(ValueGroup::Date.is_temporal());
        assert!(ValueGroup::DurationArray.is_temporal());
        assert!(!ValueGroup::Text.is_temporal());
        assert!(!ValueGroup::GeometryArray.is_temporal());
    }

    #[test]
    fn test_display() {
        assert_eq!(ValueGroup::Text.to_string(), "TEXT");
        assert_eq!(ValueGroup::ZonedTimeArray.to_string(), "ZONED_TIME_ARRAY");
    }
}

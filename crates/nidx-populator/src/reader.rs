//! Queries over an online index.

use crate::descriptor::IndexDescriptor;
use crate::sample::{IndexSample, SampleBuilder};
use nidx_common::{IndexError, Point, Result, Value, ValueGroup};
use nidx_storage::{
    Cancellation, EntityId, GenericLayout, IndexKey, IndexTree, Inclusion, KeySlot, Layout,
    Scalar, SeekOrder, Seeker, SlotValue,
};
use std::ops::Bound;
use std::sync::Arc;

/// Predicate on one indexed property.
#[derive(Debug, Clone, PartialEq)]
pub enum IndexQuery {
    /// Any value.
    Exists,
    /// Exactly this value.
    Exact(Value),
    /// Values of one group between two bounds.
    Range { from: Bound<Value>, to: Bound<Value> },
    /// Text starting with the prefix.
    StringPrefix(String),
    /// Points inside the axis-aligned box spanned by two corners.
    Geometry { lower_left: Point, upper_right: Point },
}

impl IndexQuery {
    pub fn exact(value: Value) -> Self {
        IndexQuery::Exact(value)
    }

    pub fn range(from: Bound<Value>, to: Bound<Value>) -> Self {
        IndexQuery::Range { from, to }
    }

    pub fn string_prefix(prefix: impl Into<String>) -> Self {
        IndexQuery::StringPrefix(prefix.into())
    }

    pub fn geometry(lower_left: Point, upper_right: Point) -> Self {
        IndexQuery::Geometry {
            lower_left,
            upper_right,
        }
    }

    fn is_exact(&self) -> bool {
        matches!(self, IndexQuery::Exact(_))
    }
}

/// Requested result order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IndexOrder {
    #[default]
    None,
    Ascending,
    Descending,
}

/// One matching index entry.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexHit {
    pub entity_id: EntityId,
    /// Indexed values, present when the query asked for them.
    pub values: Option<Vec<Value>>,
}

/// Checks the parts of a match the key order cannot express.
#[derive(Debug, Clone)]
enum SlotFilter {
    Any,
    Exact(KeySlot),
    Prefix(Vec<u8>),
    Within { lower_left: Point, upper_right: Point },
}

impl SlotFilter {
    fn matches(&self, slot: &KeySlot) -> bool {
        match self {
            SlotFilter::Any => true,
            SlotFilter::Exact(expected) => slot.exact_eq(expected),
            SlotFilter::Prefix(prefix) => match slot.value() {
                SlotValue::Scalar(Scalar::Text(bytes)) => bytes.starts_with(prefix),
                _ => false,
            },
            SlotFilter::Within {
                lower_left,
                upper_right,
            } => match slot.value() {
                SlotValue::Scalar(Scalar::Point { point, .. }) => {
                    point.crs() == lower_left.crs()
                        && point
                            .coordinates()
                            .iter()
                            .zip(lower_left.coordinates().iter().zip(upper_right.coordinates()))
                            .all(|(c, (lo, hi))| *lo <= *c && *c <= *hi)
                }
                _ => false,
            },
        }
    }
}

/// Smallest byte string above every string starting with `prefix`.
fn prefix_upper_bound(prefix: &[u8]) -> Option<Vec<u8>> {
    let end = prefix.iter().rposition(|b| *b != 0xFF)?;
    let mut upper = prefix[..=end].to_vec();
    upper[end] += 1;
    Some(upper)
}

fn range_group(from: &Bound<Value>, to: &Bound<Value>) -> Result<ValueGroup> {
    let group_of = |bound: &Bound<Value>| match bound {
        Bound::Included(v) | Bound::Excluded(v) => Some(v.group()),
        Bound::Unbounded => None,
    };
    match (group_of(from), group_of(to)) {
        (Some(a), Some(b)) if a != b => Err(IndexError::InvalidArgument(format!(
            "range bounds of different groups: {:?} and {:?}",
            a, b
        ))),
        (Some(g), _) | (_, Some(g)) => Ok(g),
        (None, None) => Err(IndexError::InvalidArgument(
            "range query needs at least one bound".to_string(),
        )),
    }
}

/// Read access to an online index.
pub struct IndexReader {
    descriptor: IndexDescriptor,
    tree: Arc<IndexTree<GenericLayout>>,
}

impl IndexReader {
    pub(crate) fn new(descriptor: IndexDescriptor, tree: Arc<IndexTree<GenericLayout>>) -> Self {
        Self { descriptor, tree }
    }

    pub fn descriptor(&self) -> &IndexDescriptor {
        &self.descriptor
    }

    pub fn entry_count(&self) -> u64 {
        self.tree.entry_count()
    }

    /// Builds the seek bounds and per-slot filters for `predicates`.
    ///
    /// Predicates are given per slot: exact predicates first, then at most
    /// one other predicate, then only `Exists`.
    fn bounds(&self, predicates: &[IndexQuery]) -> Result<(IndexKey, IndexKey, Vec<SlotFilter>)> {
        let layout = self.tree.layout();
        if predicates.len() != layout.slot_count() {
            return Err(IndexError::InvalidArgument(format!(
                "index '{}' needs {} predicates, got {}",
                self.descriptor.name,
                layout.slot_count(),
                predicates.len()
            )));
        }
        let curve = layout.curve();
        let mut from = layout.new_key();
        let mut to = layout.new_key();
        from.set_entity_id(EntityId::MIN);
        to.set_entity_id(EntityId::MAX);
        let mut filters = Vec::with_capacity(predicates.len());
        let mut open = false;

        for (i, predicate) in predicates.iter().enumerate() {
            if open && *predicate != IndexQuery::Exists {
                return Err(IndexError::InvalidArgument(format!(
                    "slot {} must be an exists predicate after a non-exact one",
                    i
                )));
            }
            let lo = from.slot_mut(i);
            let hi = to.slot_mut(i);
            let filter = match predicate {
                IndexQuery::Exact(value) => {
                    lo.write_value(value, Inclusion::Neutral, curve)?;
                    hi.write_value(value, Inclusion::Neutral, curve)?;
                    SlotFilter::Exact(lo.clone())
                }
                IndexQuery::Exists => {
                    lo.init_lowest_of_all();
                    hi.init_highest_of_all();
                    SlotFilter::Any
                }
                IndexQuery::Range {
                    from: lower,
                    to: upper,
                } => {
                    let group = range_group(lower, upper)?;
                    match lower {
                        Bound::Included(v) => lo.write_value(v, Inclusion::Low, curve)?,
                        Bound::Excluded(v) => lo.write_value(v, Inclusion::High, curve)?,
                        Bound::Unbounded => lo.init_lowest(group),
                    }
                    match upper {
                        Bound::Included(v) => hi.write_value(v, Inclusion::High, curve)?,
                        Bound::Excluded(v) => hi.write_value(v, Inclusion::Low, curve)?,
                        Bound::Unbounded => hi.init_highest(group),
                    }
                    SlotFilter::Any
                }
                IndexQuery::StringPrefix(prefix) => {
                    lo.write_value(&Value::text(prefix.as_str()), Inclusion::Low, curve)?;
                    match prefix_upper_bound(prefix.as_bytes()) {
                        Some(upper) => {
                            hi.set_value(SlotValue::Scalar(Scalar::Text(upper)));
                            hi.set_inclusion(Inclusion::Low);
                        }
                        None => hi.init_highest(ValueGroup::Text),
                    }
                    SlotFilter::Prefix(prefix.as_bytes().to_vec())
                }
                IndexQuery::Geometry {
                    lower_left,
                    upper_right,
                } => {
                    if lower_left.crs() != upper_right.crs() {
                        return Err(IndexError::InvalidArgument(
                            "geometry corners use different coordinate systems".to_string(),
                        ));
                    }
                    lo.write_value(&Value::Point(*lower_left), Inclusion::Low, curve)?;
                    hi.write_value(&Value::Point(*upper_right), Inclusion::High, curve)?;
                    SlotFilter::Within {
                        lower_left: *lower_left,
                        upper_right: *upper_right,
                    }
                }
            };
            open |= !predicate.is_exact();
            filters.push(filter);
        }
        Ok((from, to, filters))
    }

    /// Finds the entries matching one predicate per slot.
    ///
    /// Any number of cursors may be open at once, also while the index is
    /// being updated.
    pub fn query(
        &self,
        order: IndexOrder,
        needs_values: bool,
        predicates: &[IndexQuery],
    ) -> Result<IndexCursor<'_>> {
        let (from, to, filters) = self.bounds(predicates)?;
        let seek_order = match order {
            IndexOrder::Descending => SeekOrder::Descending,
            IndexOrder::None | IndexOrder::Ascending => SeekOrder::Ascending,
        };
        Ok(IndexCursor {
            seeker: self.tree.seek(&from, &to, seek_order),
            filters,
            needs_values,
        })
    }

    /// Number of entries matching `predicates`.
    pub fn count(&self, predicates: &[IndexQuery]) -> Result<u64> {
        let mut count = 0;
        for hit in self.query(IndexOrder::None, false, predicates)? {
            hit?;
            count += 1;
        }
        Ok(count)
    }

    /// Creates a sampler over the current contents of the index.
    pub fn create_sampler(&self) -> IndexSampler {
        IndexSampler {
            tree: Arc::clone(&self.tree),
            unique: self.descriptor.unique,
        }
    }
}

/// Cursor over query results.
pub struct IndexCursor<'r> {
    seeker: Seeker<'r, GenericLayout>,
    filters: Vec<SlotFilter>,
    needs_values: bool,
}

impl Iterator for IndexCursor<'_> {
    type Item = Result<IndexHit>;

    fn next(&mut self) -> Option<Result<IndexHit>> {
        loop {
            let key = self.seeker.next()?;
            let matches = self
                .filters
                .iter()
                .zip(key.slots())
                .all(|(filter, slot)| filter.matches(slot));
            if !matches {
                continue;
            }
            let values = if self.needs_values {
                match key.to_values() {
                    Ok(values) => Some(values),
                    Err(e) => return Some(Err(e)),
                }
            } else {
                None
            };
            return Some(Ok(IndexHit {
                entity_id: key.entity_id(),
                values,
            }));
        }
    }
}

/// Recomputes a sample from an online index.
pub struct IndexSampler {
    tree: Arc<IndexTree<GenericLayout>>,
    unique: bool,
}

impl IndexSampler {
    pub fn sample(&self, cancel: &Cancellation) -> Result<IndexSample> {
        if self.unique {
            return Ok(IndexSample::unique(self.tree.entry_count()));
        }
        let layout = Arc::clone(self.tree.layout());
        let mut builder = SampleBuilder::<GenericLayout>::new();
        for (i, key) in self.tree.scan(SeekOrder::Ascending).enumerate() {
            if i % 4096 == 0 {
                cancel.check()?;
            }
            builder.include(&layout, &key);
        }
        Ok(builder.build())
    }
}

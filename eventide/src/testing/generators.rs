//! Property test generators for domain types.
//!
//! Each generator respects the validation rules of its corresponding type.

use crate::cqrs::{Filter, FilterLogic, FilterOperator, FilterValue, NestedFilter};
use crate::types::{AggregateId, EventVersion, IndexName, PartitionKey, StreamKey, WorkerId};
use proptest::prelude::*;

/// Generates valid `AggregateId` values.
///
/// # Example
/// ```rust,ignore
/// use proptest::prelude::*;
/// use eventide::testing::generators::arb_aggregate_id;
///
/// proptest! {
///     #[test]
///     fn ids_are_never_blank(id in arb_aggregate_id()) {
///         assert!(!id.as_ref().trim().is_empty());
///     }
/// }
/// ```
pub fn arb_aggregate_id() -> impl Strategy<Value = AggregateId> {
    "[a-zA-Z0-9][a-zA-Z0-9._-]{0,63}"
        .prop_filter_map("Invalid AggregateId", |s| AggregateId::try_new(s).ok())
}

/// Generates valid `PartitionKey` values.
pub fn arb_partition_key() -> impl Strategy<Value = PartitionKey> {
    "[a-z][a-z0-9-]{0,15}".prop_filter_map("Invalid PartitionKey", |s| PartitionKey::try_new(s).ok())
}

/// Generates stream keys.
pub fn arb_stream_key() -> impl Strategy<Value = StreamKey> {
    (arb_aggregate_id(), arb_partition_key())
        .prop_map(|(aggregate_id, partition_key)| StreamKey::new(aggregate_id, partition_key))
}

/// Generates valid `IndexName` values.
pub fn arb_index_name() -> impl Strategy<Value = IndexName> {
    "[a-z][a-z0-9-]{0,31}".prop_filter_map("Invalid IndexName", |s| IndexName::try_new(s).ok())
}

/// Generates valid `WorkerId` values.
pub fn arb_worker_id() -> impl Strategy<Value = WorkerId> {
    "worker-[a-z0-9]{1,12}".prop_filter_map("Invalid WorkerId", |s| WorkerId::try_new(s).ok())
}

/// Generates small `EventVersion` values suitable for testing.
pub fn arb_small_event_version() -> impl Strategy<Value = EventVersion> {
    (0usize..=10).prop_map(|count| EventVersion::initial().advance(count))
}

/// Generates filter operators.
pub fn arb_filter_operator() -> impl Strategy<Value = FilterOperator> {
    prop_oneof![
        Just(FilterOperator::Eq),
        Just(FilterOperator::Ne),
        Just(FilterOperator::Gt),
        Just(FilterOperator::Ge),
        Just(FilterOperator::Lt),
        Just(FilterOperator::Le),
        Just(FilterOperator::Contains),
        Just(FilterOperator::StartsWith),
    ]
}

/// Text that exercises every character class the wire format treats
/// specially: the five escaped characters, the pipe and plus separators,
/// percent signs, spaces and non-ASCII letters. Never contains `;`, so it
/// can never spell an escape token.
fn arb_wire_text(min: usize, max: usize) -> impl Strategy<Value = String> {
    proptest::collection::vec(
        prop_oneof![
            4 => proptest::char::range('a', 'z'),
            2 => proptest::char::range('0', '9'),
            1 => proptest::sample::select(vec![
                '.', '&', '!', '$', '\'', '|', '+', '%', ' ', '-', '_', '~', '/', 'é', 'ß', '日',
            ]),
        ],
        min..=max,
    )
    .prop_map(|chars| chars.into_iter().collect())
}

fn arb_flat_filter() -> impl Strategy<Value = Filter> {
    (
        arb_wire_text(1, 16),
        arb_filter_operator(),
        arb_wire_text(0, 24),
        any::<bool>(),
        arb_wire_text(0, 12),
    )
        .prop_map(|(property, operator, value, visible, tag)| Filter {
            property,
            operator,
            value: FilterValue::from(value),
            visible,
            tag,
            nested: Vec::new(),
        })
}

/// Generates representable filters, nested up to three levels deep.
pub fn arb_filter() -> impl Strategy<Value = Filter> {
    arb_flat_filter().prop_recursive(3, 12, 3, |inner| {
        (
            arb_flat_filter(),
            proptest::collection::vec(
                (prop_oneof![Just(FilterLogic::And), Just(FilterLogic::Or)], inner),
                1..=3,
            ),
        )
            .prop_map(|(mut filter, nested)| {
                filter.nested = nested
                    .into_iter()
                    .map(|(logic, filter)| NestedFilter { logic, filter })
                    .collect();
                filter
            })
    })
}

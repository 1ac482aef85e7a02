//! Property-based test generators using proptest.
//!
//! Value ranges are kept small so generated operations collide often.

use proptest::prelude::*;
use synset_protocol::{Member, MemberSet, Operation};

/// Strategy for integer set values drawn from a small range.
pub fn value_strategy() -> impl Strategy<Value = i64> {
    -16i64..16
}

/// Strategy for short lowercase string values.
pub fn text_value_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z]{1,6}").expect("Invalid regex")
}

/// Strategy for value lists, duplicates included.
pub fn values_strategy() -> impl Strategy<Value = Vec<i64>> {
    prop::collection::vec(value_strategy(), 0..8)
}

/// Strategy for set states.
pub fn member_set_strategy() -> impl Strategy<Value = MemberSet<i64>> {
    values_strategy().prop_map(|values| {
        values
            .into_iter()
            .filter_map(|v| Member::new(v).ok())
            .collect()
    })
}

/// Strategy for operations of every kind.
pub fn operation_strategy() -> impl Strategy<Value = Operation<i64>> {
    prop_oneof![
        4 => value_strategy().prop_filter_map("encodable", |v| Operation::add(v).ok()),
        3 => value_strategy().prop_filter_map("encodable", |v| Operation::remove(v).ok()),
        1 => Just(Operation::Clear),
        2 => values_strategy().prop_filter_map("encodable", |v| Operation::add_all(v).ok()),
        1 => values_strategy().prop_filter_map("encodable", |v| Operation::replace_all(v).ok()),
    ]
}

/// Strategy for operations on string values.
pub fn text_operation_strategy() -> impl Strategy<Value = Operation<String>> {
    let values = prop::collection::vec(text_value_strategy(), 0..6).boxed();
    prop_oneof![
        text_value_strategy().prop_filter_map("encodable", |v| Operation::add(v).ok()),
        text_value_strategy().prop_filter_map("encodable", |v| Operation::remove(v).ok()),
        Just(Operation::Clear),
        values
            .clone()
            .prop_filter_map("encodable", |v| Operation::add_all(v).ok()),
        values.prop_filter_map("encodable", |v| Operation::replace_all(v).ok()),
    ]
}

/// Strategy for a workload: operations tagged with the index of the node
/// issuing them, for clusters of `nodes` nodes.
pub fn workload_strategy(
    nodes: usize,
    max_len: usize,
) -> impl Strategy<Value = Vec<(usize, Operation<i64>)>> {
    prop::collection::vec((0..nodes.max(1), operation_strategy()), 0..max_len)
}

// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Conditional rendering: pick exactly one of four branches for a read state.
//!
//! Decision table, first match wins:
//!
//! | # | condition        | branch      |
//! |---|------------------|-------------|
//! | 1 | `is_error`       | `Error`     |
//! | 2 | `is_loading`     | `Loading`   |
//! | 3 | data empty       | `Empty`     |
//! | 4 | otherwise        | `Populated` |
//!
//! "Empty" is decided by [`IsEmpty`]: `None`, empty collections, empty
//! strings, and JSON `null` / `[]` / `{}` / `""`. Plain values (numbers,
//! records) are never empty.
//!
//! Pure functions of the state; nothing here touches the cache.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use serde_json::Value;

use crate::error::QueryError;
use crate::observer::QueryState;

/// The branch to render.
#[derive(Debug)]
pub enum RenderBranch<'a, T> {
    Error(Option<&'a QueryError>),
    Loading,
    Empty,
    Populated(&'a Arc<T>),
}

impl<T> RenderBranch<'_, T> {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Error(_) => "error",
            Self::Loading => "loading",
            Self::Empty => "empty",
            Self::Populated(_) => "populated",
        }
    }
}

#[must_use]
pub fn select_branch<T: IsEmpty>(state: &QueryState<T>) -> RenderBranch<'_, T> {
    if state.is_error {
        return RenderBranch::Error(state.error.as_ref());
    }
    if state.is_loading {
        return RenderBranch::Loading;
    }
    match &state.data {
        Some(data) if !IsEmpty::is_empty(&**data) => RenderBranch::Populated(data),
        _ => RenderBranch::Empty,
    }
}

/// One closure per branch; [`render`] calls exactly one of them.
pub struct RenderArms<E, L, M, P> {
    pub error: E,
    pub loading: L,
    pub empty: M,
    pub populated: P,
}

pub fn render<T, R, E, L, M, P>(state: &QueryState<T>, arms: RenderArms<E, L, M, P>) -> R
where
    T: IsEmpty,
    E: FnOnce(Option<&QueryError>) -> R,
    L: FnOnce() -> R,
    M: FnOnce() -> R,
    P: FnOnce(&Arc<T>) -> R,
{
    match select_branch(state) {
        RenderBranch::Error(error) => (arms.error)(error),
        RenderBranch::Loading => (arms.loading)(),
        RenderBranch::Empty => (arms.empty)(),
        RenderBranch::Populated(data) => (arms.populated)(data),
    }
}

/// Whether fetched data counts as "nothing to show".
pub trait IsEmpty {
    fn is_empty(&self) -> bool;
}

impl<T> IsEmpty for [T] {
    fn is_empty(&self) -> bool {
        <[T]>::is_empty(self)
    }
}

impl<T> IsEmpty for Vec<T> {
    fn is_empty(&self) -> bool {
        Vec::is_empty(self)
    }
}

impl<T> IsEmpty for VecDeque<T> {
    fn is_empty(&self) -> bool {
        VecDeque::is_empty(self)
    }
}

impl<K, V, S> IsEmpty for HashMap<K, V, S> {
    fn is_empty(&self) -> bool {
        HashMap::is_empty(self)
    }
}

impl<K, S> IsEmpty for HashSet<K, S> {
    fn is_empty(&self) -> bool {
        HashSet::is_empty(self)
    }
}

impl<K, V> IsEmpty for BTreeMap<K, V> {
    fn is_empty(&self) -> bool {
        BTreeMap::is_empty(self)
    }
}

impl<K> IsEmpty for BTreeSet<K> {
    fn is_empty(&self) -> bool {
        BTreeSet::is_empty(self)
    }
}

impl IsEmpty for str {
    fn is_empty(&self) -> bool {
        str::is_empty(self)
    }
}

impl IsEmpty for String {
    fn is_empty(&self) -> bool {
        String::is_empty(self)
    }
}

impl IsEmpty for Value {
    fn is_empty(&self) -> bool {
        match self {
            Value::Null => true,
            Value::Array(items) => items.is_empty(),
            Value::Object(fields) => fields.is_empty(),
            Value::String(s) => s.is_empty(),
            Value::Bool(_) | Value::Number(_) => false,
        }
    }
}

impl<T: IsEmpty> IsEmpty for Option<T> {
    fn is_empty(&self) -> bool {
        self.as_ref().map_or(true, IsEmpty::is_empty)
    }
}

impl<T: IsEmpty + ?Sized> IsEmpty for Arc<T> {
    fn is_empty(&self) -> bool {
        (**self).is_empty()
    }
}

impl<T: IsEmpty + ?Sized> IsEmpty for Box<T> {
    fn is_empty(&self) -> bool {
        (**self).is_empty()
    }
}

macro_rules! never_empty {
    ($($ty:ty),* $(,)?) => {
        $(
            impl IsEmpty for $ty {
                fn is_empty(&self) -> bool {
                    false
                }
            }
        )*
    };
}

never_empty!(bool, u8, u16, u32, u64, usize, i8, i16, i32, i64, isize, f32, f64);

//! The patch model.
//!
//! A [`Patch`] is an ordered list of structural operations; applying it to
//! the prior state yields the next state, and it is empty exactly when no
//! mutation was observed. `Object`/`Array` are diffed recursively and
//! path-addressed; the other rich-value kinds (`Map`/`Set`/`Date`/
//! `BigInt`/`Regex`/`Bytes`) are treated as atomic leaves — a change to one
//! of those emits a single whole-value `Replace` (see DESIGN.md Open
//! Question #5). This is a small, dependency-free diff engine rather
//! than a full structural-patch library.

use std::ops::{Deref, DerefMut};

use serde::{Deserialize, Serialize};

use crate::error::{PatchError, RichError};
use crate::rich::{deep_equal, to_rich, RichValue};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PathSegment {
    Field(String),
    Index(usize),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PatchOp {
    Add {
        path: Vec<PathSegment>,
        value: RichValue,
    },
    Remove {
        path: Vec<PathSegment>,
    },
    Replace {
        path: Vec<PathSegment>,
        value: RichValue,
    },
}

/// An ordered sequence of structural operations describing a diff between
/// two state values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Patch(pub Vec<PatchOp>);

impl Patch {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn ops(&self) -> &[PatchOp] {
        &self.0
    }

    /// Computes the patch that turns `before` into `after`.
    pub fn diff(before: &RichValue, after: &RichValue) -> Patch {
        let mut ops = Vec::new();
        diff_into(before, after, &mut Vec::new(), &mut ops);
        Patch(ops)
    }

    /// Applies this patch to `base`, returning the resulting value.
    pub fn apply(&self, base: &RichValue) -> Result<RichValue, PatchError> {
        let mut result = base.clone();
        for op in &self.0 {
            apply_op(&mut result, op)?;
        }
        Ok(result)
    }
}

fn diff_into(before: &RichValue, after: &RichValue, path: &mut Vec<PathSegment>, ops: &mut Vec<PatchOp>) {
    if deep_equal(before, after) {
        return;
    }
    match (before, after) {
        (RichValue::Object(b_fields), RichValue::Object(a_fields)) => {
            for key in b_fields.keys() {
                if !a_fields.contains_key(key) {
                    path.push(PathSegment::Field(key.clone()));
                    ops.push(PatchOp::Remove { path: path.clone() });
                    path.pop();
                }
            }
            for (key, a_value) in a_fields {
                path.push(PathSegment::Field(key.clone()));
                match b_fields.get(key) {
                    None => ops.push(PatchOp::Add {
                        path: path.clone(),
                        value: a_value.clone(),
                    }),
                    Some(b_value) => diff_into(b_value, a_value, path, ops),
                }
                path.pop();
            }
        }
        (RichValue::Array(b_items), RichValue::Array(a_items)) => {
            let common = b_items.len().min(a_items.len());
            for i in 0..common {
                path.push(PathSegment::Index(i));
                diff_into(&b_items[i], &a_items[i], path, ops);
                path.pop();
            }
            if a_items.len() > b_items.len() {
                for (i, item) in a_items.iter().enumerate().skip(common) {
                    path.push(PathSegment::Index(i));
                    ops.push(PatchOp::Add {
                        path: path.clone(),
                        value: item.clone(),
                    });
                    path.pop();
                }
            } else if b_items.len() > a_items.len() {
                for i in (common..b_items.len()).rev() {
                    path.push(PathSegment::Index(i));
                    ops.push(PatchOp::Remove { path: path.clone() });
                    path.pop();
                }
            }
        }
        _ => ops.push(PatchOp::Replace {
            path: path.clone(),
            value: after.clone(),
        }),
    }
}

fn navigate_mut<'a>(root: &'a mut RichValue, path: &[PathSegment]) -> Result<&'a mut RichValue, PatchError> {
    let mut cur = root;
    for seg in path {
        cur = match (cur, seg) {
            (RichValue::Object(fields), PathSegment::Field(key)) => {
                fields.get_mut(key).ok_or(PatchError::PathNotFound)?
            }
            (RichValue::Array(items), PathSegment::Index(i)) => {
                items.get_mut(*i).ok_or(PatchError::PathNotFound)?
            }
            _ => return Err(PatchError::NotAContainer),
        };
    }
    Ok(cur)
}

fn apply_op(root: &mut RichValue, op: &PatchOp) -> Result<(), PatchError> {
    match op {
        PatchOp::Replace { path, value } => {
            if path.is_empty() {
                *root = value.clone();
                return Ok(());
            }
            let parent = navigate_mut(root, &path[..path.len() - 1])?;
            set_in_container(parent, path.last().unwrap(), value.clone(), true)
        }
        PatchOp::Add { path, value } => {
            if path.is_empty() {
                *root = value.clone();
                return Ok(());
            }
            let parent = navigate_mut(root, &path[..path.len() - 1])?;
            set_in_container(parent, path.last().unwrap(), value.clone(), false)
        }
        PatchOp::Remove { path } => {
            let parent = navigate_mut(root, &path[..path.len() - 1])?;
            remove_from_container(parent, path.last().unwrap())
        }
    }
}

fn set_in_container(
    parent: &mut RichValue,
    seg: &PathSegment,
    value: RichValue,
    must_exist: bool,
) -> Result<(), PatchError> {
    match (parent, seg) {
        (RichValue::Object(fields), PathSegment::Field(key)) => {
            if must_exist && !fields.contains_key(key) {
                return Err(PatchError::PathNotFound);
            }
            fields.insert(key.clone(), value);
            Ok(())
        }
        (RichValue::Array(items), PathSegment::Index(i)) => {
            if must_exist {
                if *i >= items.len() {
                    return Err(PatchError::PathNotFound);
                }
                items[*i] = value;
            } else if *i == items.len() {
                items.push(value);
            } else if *i < items.len() {
                items.insert(*i, value);
            } else {
                return Err(PatchError::PathNotFound);
            }
            Ok(())
        }
        _ => Err(PatchError::NotAContainer),
    }
}

fn remove_from_container(parent: &mut RichValue, seg: &PathSegment) -> Result<(), PatchError> {
    match (parent, seg) {
        (RichValue::Object(fields), PathSegment::Field(key)) => {
            fields.shift_remove(key).ok_or(PatchError::PathNotFound)?;
            Ok(())
        }
        (RichValue::Array(items), PathSegment::Index(i)) => {
            if *i < items.len() {
                items.remove(*i);
                Ok(())
            } else {
                Err(PatchError::PathNotFound)
            }
        }
        _ => Err(PatchError::NotAContainer),
    }
}

/// A mutable working copy of an entity's state, handed to command/stream
/// handlers. Mutations are observed only through the `Deref`/`DerefMut`
/// target; [`Draft::finish`] diffs the working copy against the state it
/// was opened from and yields the resulting patch alongside the new state.
/// Discarding a `Draft` (dropping it without calling `finish`) leaves the
/// entity's live state untouched -- the discard-on-error path for a
/// failed handler invocation.
pub struct Draft<S> {
    original: RichValue,
    value: S,
}

impl<S> Deref for Draft<S> {
    type Target = S;
    fn deref(&self) -> &S {
        &self.value
    }
}

impl<S> DerefMut for Draft<S> {
    fn deref_mut(&mut self) -> &mut S {
        &mut self.value
    }
}

impl<S> Draft<S>
where
    S: Serialize + Clone,
{
    pub fn new(state: &S) -> Result<Self, RichError> {
        Ok(Draft {
            original: to_rich(state)?,
            value: state.clone(),
        })
    }

    /// Closes the draft, returning the patch observed and the resulting
    /// state.
    pub fn finish(self) -> Result<(Patch, S), RichError> {
        let after = to_rich(&self.value)?;
        let patch = Patch::diff(&self.original, &after);
        Ok((patch, self.value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize as SerdeDeserialize;

    #[derive(Debug, Clone, Serialize, SerdeDeserialize, PartialEq)]
    struct Counter {
        count: i64,
        label: String,
    }

    #[test]
    fn no_mutation_yields_empty_patch() {
        let state = Counter { count: 0, label: "a".into() };
        let draft = Draft::new(&state).unwrap();
        let (patch, next) = draft.finish().unwrap();
        assert!(patch.is_empty());
        assert_eq!(next, state);
    }

    #[test]
    fn mutation_yields_replace_and_applies_forward() {
        let state = Counter { count: 0, label: "a".into() };
        let mut draft = Draft::new(&state).unwrap();
        draft.count = 10;
        let (patch, next) = draft.finish().unwrap();
        assert!(!patch.is_empty());
        assert_eq!(next.count, 10);

        let before_rich = to_rich(&state).unwrap();
        let after_rich = patch.apply(&before_rich).unwrap();
        let round_tripped: Counter = crate::rich::from_rich(&after_rich).unwrap();
        assert_eq!(round_tripped, next);
    }

    #[test]
    fn array_growth_and_shrink_round_trips() {
        let before = RichValue::Array(vec![RichValue::Int(1), RichValue::Int(2)]);
        let after = RichValue::Array(vec![RichValue::Int(1), RichValue::Int(2), RichValue::Int(3)]);
        let patch = Patch::diff(&before, &after);
        assert_eq!(patch.apply(&before).unwrap(), after);

        let shrink_patch = Patch::diff(&after, &before);
        assert_eq!(shrink_patch.apply(&after).unwrap(), before);
    }
}

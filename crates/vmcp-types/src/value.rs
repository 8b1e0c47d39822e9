use std::fmt;
use std::sync::Arc;

use crate::error::TypeError;
use crate::hash::{Hash, StructuralHasher};

/// Largest number of children a tuple may hold.
pub const MAX_TUPLE_ARITY: usize = 8;

/// An immutable, finite, tree-shaped datum.
///
/// Values form a DAG: cloning a tuple clones an `Arc`, so a sub-value placed
/// at several positions is one allocation. Equality is structural and is
/// decided by comparing hashes.
#[derive(Clone)]
pub enum Value {
    /// Integer scalar.
    Int(i64),
    /// Tuple of 1..=[`MAX_TUPLE_ARITY`] ordered children.
    Tuple(Tuple),
    /// The arity-0 tuple.
    EmptyTuple,
}

/// Shared, hash-cached tuple node.
#[derive(Clone)]
pub struct Tuple(Arc<TupleNode>);

struct TupleNode {
    items: Box<[Value]>,
    hash: Hash,
}

impl Value {
    /// Integer scalar.
    pub fn int(v: i64) -> Self {
        Self::Int(v)
    }

    /// The empty tuple.
    pub fn empty_tuple() -> Self {
        Self::EmptyTuple
    }

    /// Build a tuple from its children.
    ///
    /// An empty list yields [`Value::EmptyTuple`]; more than
    /// [`MAX_TUPLE_ARITY`] children is rejected.
    pub fn tuple(items: Vec<Value>) -> Result<Self, TypeError> {
        if items.is_empty() {
            return Ok(Self::EmptyTuple);
        }
        if items.len() > MAX_TUPLE_ARITY {
            return Err(TypeError::TupleTooLarge {
                arity: items.len(),
                max: MAX_TUPLE_ARITY,
            });
        }
        let child_hashes: Vec<Hash> = items.iter().map(Value::hash).collect();
        let hash = StructuralHasher::TUPLE.hash_children(&child_hashes);
        Ok(Self::Tuple(Tuple(Arc::new(TupleNode {
            items: items.into_boxed_slice(),
            hash,
        }))))
    }

    /// Structural hash of this value.
    ///
    /// Tuples cache their hash at construction, so this is O(1).
    pub fn hash(&self) -> Hash {
        match self {
            Self::Int(v) => StructuralHasher::INT.hash_int(*v),
            Self::Tuple(t) => t.0.hash,
            Self::EmptyTuple => Self::empty_tuple_hash(),
        }
    }

    /// Hash of the empty tuple.
    pub fn empty_tuple_hash() -> Hash {
        StructuralHasher::TUPLE.hash_children(&[])
    }

    /// Children of a tuple; empty for scalars and the empty tuple.
    pub fn children(&self) -> &[Value] {
        match self {
            Self::Tuple(t) => &t.0.items,
            Self::Int(_) | Self::EmptyTuple => &[],
        }
    }

    /// Number of children (0 for scalars).
    pub fn arity(&self) -> usize {
        self.children().len()
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns `true` for tuples of any arity, including the empty tuple.
    pub fn is_tuple(&self) -> bool {
        !matches!(self, Self::Int(_))
    }

    /// Returns `true` if both values are the same tuple allocation.
    ///
    /// Used to check that structural sharing survived a round-trip.
    pub fn ptr_eq(a: &Value, b: &Value) -> bool {
        match (a, b) {
            (Self::Tuple(x), Self::Tuple(y)) => Arc::ptr_eq(&x.0, &y.0),
            _ => false,
        }
    }
}

impl Tuple {
    /// Child at `index`.
    pub fn get(&self, index: usize) -> Option<&Value> {
        self.0.items.get(index)
    }

    pub fn len(&self) -> usize {
        self.0.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.items.is_empty()
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.hash() == other.hash()
    }
}

impl Eq for Value {}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "Int({v})"),
            Self::EmptyTuple => write!(f, "()"),
            Self::Tuple(t) => f.debug_tuple("Tuple").field(&&*t.0.items).finish(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::EmptyTuple => write!(f, "()"),
            Self::Tuple(t) => {
                write!(f, "(")?;
                for (i, item) in t.0.items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, ")")
            }
        }
    }
}

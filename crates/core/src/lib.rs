//! kairn core: the generic object model, object identity and the cluster adapter contract.

#![forbid(unsafe_code)]

pub mod adapter;
pub mod mem;
pub mod object;
pub mod path;
pub mod reference;

pub use adapter::{AdapterError, AdapterErrorKind, ClusterAdapter, Labels};
pub use mem::MemCluster;
pub use object::{GenericObject, MergeStrategy, ObjectError};
pub use path::{FieldPath, PathSegment};
pub use reference::{GroupKind, KindInfo, ObjectKey, ObjectRef};

pub mod prelude {
    pub use super::{
        AdapterError, AdapterErrorKind, ClusterAdapter, FieldPath, GenericObject, GroupKind, KindInfo, Labels,
        MergeStrategy, ObjectError, ObjectKey, ObjectRef,
    };
}

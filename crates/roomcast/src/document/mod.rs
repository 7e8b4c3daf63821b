pub mod doc;
pub mod operation;

pub use doc::{DocumentSnapshot, DocumentState};
pub use operation::{transform, Edit, Operation};

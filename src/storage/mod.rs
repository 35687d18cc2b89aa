pub mod array;
pub mod chain;
mod changes;
pub mod column;
pub mod delta;
pub mod segment;
pub mod table;

pub use self::array::{Dictionary, DictionaryTiers, Fit, StorageArray, StorageKind};
pub use self::chain::{VersionChain, Versioned};
pub use self::column::{AccessMode, Column, ColumnView, CountMode};
pub use self::delta::{Delta, UpdateSet};
pub use self::segment::{Candidates, Claim, Segment, Segments, ZOMBIE_TS};
pub use self::table::{ColumnDef, DeleteCount, Persistence, Table, TableStorage};

pub mod sequence_table;

pub use sequence_table::SequenceTable;

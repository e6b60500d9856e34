// Library exports for adda
pub mod input;
pub mod link_store;
pub mod optimizer;
pub mod partition;
pub mod scoring;
pub mod segment_tree;
pub mod sequence_index;
pub mod union_find;

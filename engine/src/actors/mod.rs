pub mod comparator;

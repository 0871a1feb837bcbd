pub mod builder;
pub mod cfg;
pub mod cli;
pub mod error;
pub mod expr;
pub mod frame;
pub mod history;
pub mod index;
pub mod resolver;
pub mod scanner;
pub mod trie;
pub mod value;

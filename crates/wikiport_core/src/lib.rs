pub mod archive;
pub mod bundle;
pub mod config;
pub mod entities;
pub mod error;
pub mod export;
pub mod html_tree;
pub mod ids;
pub mod markup;
pub mod path_codec;

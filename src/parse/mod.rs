mod descriptor;
#[allow(clippy::module_inception)]
mod parse;

pub use descriptor::{pad_labels, CommandDescriptor, DescriptorError, Requirement};
pub use parse::{normalize, parser, parser_in, ConfigError};

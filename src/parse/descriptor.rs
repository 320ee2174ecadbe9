use thiserror::Error;

/// Whether a command's termination brings the whole group down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Requirement {
    /// Any termination, success or failure, starts the shutdown cascade.
    Required,
    /// Never starts the cascade.
    Optional,
    /// Starts the cascade only when the command fails.
    #[default]
    Unspecified,
}

impl Requirement {
    /// `true` / `false` / `null` as written in a config file.
    pub fn from_marker(marker: Option<bool>) -> Self {
        match marker {
            Some(true) => Requirement::Required,
            Some(false) => Requirement::Optional,
            None => Requirement::Unspecified,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DescriptorError {
    #[error("command label must not be empty")]
    EmptyLabel,
    #[error("command `{label}` has an empty executable")]
    EmptyExecutable { label: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandDescriptor {
    pub required: Requirement,
    pub label: String,
    pub executable: String,
    pub arguments: Vec<String>,
}

impl CommandDescriptor {
    pub fn new(
        required: Requirement,
        label: impl Into<String>,
        executable: impl Into<String>,
        arguments: Vec<String>,
    ) -> Result<Self, DescriptorError> {
        let descriptor = Self {
            required,
            label: label.into(),
            executable: executable.into(),
            arguments,
        };
        descriptor.validate()?;
        Ok(descriptor)
    }

    pub fn validate(&self) -> Result<(), DescriptorError> {
        if self.label.trim().is_empty() {
            return Err(DescriptorError::EmptyLabel);
        }
        if self.executable.is_empty() {
            return Err(DescriptorError::EmptyExecutable {
                label: self.label.clone(),
            });
        }
        Ok(())
    }
}

/*
    @@@
    @pad_labels();
    . Right-pads every label with spaces to the widest label of the run (counted in chars) so tagged lines align.
    . Runs once, before anything is spawned.
*/
pub fn pad_labels(commands: &mut [CommandDescriptor]) {
    let width = commands
        .iter()
        .map(|c| c.label.chars().count())
        .max()
        .unwrap_or(0);

    for command in commands.iter_mut() {
        command.label = format!("{:<width$}", command.label, width = width);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmd(label: &str) -> CommandDescriptor {
        CommandDescriptor::new(Requirement::Unspecified, label, "true", vec![]).unwrap()
    }

    #[test]
    fn pads_to_widest_label() {
        let mut commands = vec![cmd("abc"), cmd("abcdefg"), cmd("a")];
        pad_labels(&mut commands);

        let labels: Vec<_> = commands.iter().map(|c| c.label.as_str()).collect();
        assert_eq!(labels, vec!["abc    ", "abcdefg", "a      "]);
        assert!(commands.iter().all(|c| c.label.chars().count() == 7));
    }

    #[test]
    fn pads_by_chars_not_bytes() {
        let mut commands = vec![cmd("héé"), cmd("abcd")];
        pad_labels(&mut commands);
        assert_eq!(commands[0].label, "héé ");
        assert_eq!(commands[1].label, "abcd");
    }

    #[test]
    fn rejects_empty_label_and_executable() {
        assert_eq!(
            CommandDescriptor::new(Requirement::Required, "", "ls", vec![]),
            Err(DescriptorError::EmptyLabel)
        );
        assert_eq!(
            CommandDescriptor::new(Requirement::Required, "ls", "", vec![]),
            Err(DescriptorError::EmptyExecutable { label: "ls".into() })
        );
    }

    #[test]
    fn requirement_markers() {
        assert_eq!(Requirement::from_marker(Some(true)), Requirement::Required);
        assert_eq!(Requirement::from_marker(Some(false)), Requirement::Optional);
        assert_eq!(Requirement::from_marker(None), Requirement::Unspecified);
    }
}

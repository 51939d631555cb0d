//! Warnings and informational notes attached to a result.

/// A single annotation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Annotation {
    Warning(String),
    Info(String),
}

/// An insertion-ordered, de-duplicated collection of annotations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Annotations(Vec<Annotation>);

impl Annotations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, annotation: Annotation) {
        if !self.0.contains(&annotation) {
            self.0.push(annotation);
        }
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        self.add(Annotation::Warning(message.into()));
    }

    pub fn info(&mut self, message: impl Into<String>) {
        self.add(Annotation::Info(message.into()));
    }

    pub fn merge(&mut self, other: Annotations) {
        for a in other.0 {
            self.add(a);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Split into warning and info strings, keeping at most `max_warnings`
    /// and `max_infos` of each (0 means no cap). Dropped entries are
    /// summarised by a trailing overflow line.
    pub fn as_strings(&self, max_warnings: usize, max_infos: usize) -> (Vec<String>, Vec<String>) {
        let mut warnings = Vec::new();
        let mut infos = Vec::new();
        let (mut warn_skipped, mut info_skipped) = (0usize, 0usize);

        for a in &self.0 {
            match a {
                Annotation::Warning(msg) => {
                    if max_warnings > 0 && warnings.len() >= max_warnings {
                        warn_skipped += 1;
                    } else {
                        warnings.push(msg.clone());
                    }
                }
                Annotation::Info(msg) => {
                    if max_infos > 0 && infos.len() >= max_infos {
                        info_skipped += 1;
                    } else {
                        infos.push(msg.clone());
                    }
                }
            }
        }

        if warn_skipped > 0 {
            warnings.push(format!("{} more warning annotations omitted", warn_skipped));
        }
        if info_skipped > 0 {
            infos.push(format!("{} more info annotations omitted", info_skipped));
        }
        (warnings, infos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deduplicates() {
        let mut a = Annotations::new();
        a.warn("x");
        a.warn("x");
        a.info("x");
        assert_eq!(a.len(), 2);
    }

    #[test]
    fn test_as_strings_caps_with_overflow_line() {
        let mut a = Annotations::new();
        for i in 0..13 {
            a.warn(format!("w{}", i));
        }
        a.info("i0");

        let (warnings, infos) = a.as_strings(10, 10);
        assert_eq!(warnings.len(), 11);
        assert_eq!(warnings[10], "3 more warning annotations omitted");
        assert_eq!(infos, vec!["i0".to_string()]);
    }
}

/// ErrorList collects the errors of a scope and reports them together at
/// scope close. The list is non-empty iff at least one sub-error occurred.
#[derive(Default)]
pub struct ErrorList {
    errs: Vec<anyhow::Error>,
}

impl ErrorList {
    pub fn new() -> Self {
        Self::default()
    }

    /// add records the error of `res`, if any. The success value is dropped.
    pub fn add<T>(&mut self, res: anyhow::Result<T>) {
        if let Err(e) = res {
            self.errs.push(e);
        }
    }

    pub fn add_err(&mut self, err: anyhow::Error) {
        self.errs.push(err);
    }

    pub fn is_empty(&self) -> bool {
        self.errs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errs.len()
    }

    /// err consumes the list, returning Ok if no errors were recorded and a
    /// single joined error otherwise.
    pub fn err(self) -> anyhow::Result<()> {
        if self.errs.is_empty() {
            return Ok(());
        }

        let msg = self
            .errs
            .iter()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join("; ");
        Err(anyhow!(msg))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty() {
        let mut el = ErrorList::new();
        el.add(Ok(1));
        el.add(Ok(()));
        assert!(el.is_empty());
        assert!(el.err().is_ok());
    }

    #[test]
    fn test_joined() {
        let mut el = ErrorList::new();
        el.add::<()>(Err(anyhow!("first")));
        el.add(Ok(()));
        el.add::<()>(Err(anyhow!("second")));
        assert_eq!(el.len(), 2);
        let err = el.err().unwrap_err();
        assert_eq!(err.to_string(), "first; second");
    }
}

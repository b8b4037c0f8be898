/*!
A linear chain of stages, each depending only on the stage before it.

Building the chain threads a single trailing dependency from one stage to the next, so a plan can never fan
out by accident. Running it executes the stages strictly in order and stops at the first failure.
*/

use std::future::Future;

/// Identifies a stage within its chain.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct StageId(usize);

#[derive(Clone, Debug, PartialEq)]
pub struct Stage<S> {
    pub id: StageId,
    /// The stage which must complete before this one starts.
    pub after: Option<StageId>,
    pub item: S,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Chain<S> {
    stages: Vec<Stage<S>>,
}

impl<S> Default for Chain<S> {
    fn default() -> Self {
        Chain { stages: Vec::new() }
    }
}

impl<S> FromIterator<S> for Chain<S> {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        iter.into_iter().fold(Chain::new(), Chain::then)
    }
}

impl<S> Chain<S> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a stage which depends on the current tail of the chain.
    pub fn then(mut self, item: S) -> Self {
        let after = self.stages.last().map(|stage| stage.id);
        let id = StageId(self.stages.len());
        self.stages.push(Stage { id, after, item });
        self
    }

    pub fn stages(&self) -> &[Stage<S>] {
        &self.stages
    }

    pub fn items(&self) -> impl Iterator<Item = &S> {
        self.stages.iter().map(|stage| &stage.item)
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Runs every stage in order. A stage starts only after the previous one returned `Ok`; the first error
    /// is returned and no later stage runs.
    pub async fn run<T, E, F, Fut>(&self, mut f: F) -> Result<Vec<T>, E>
    where
        F: FnMut(&S) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut outputs = Vec::with_capacity(self.stages.len());
        for stage in &self.stages {
            outputs.push(f(&stage.item).await?);
        }
        Ok(outputs)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_single_trailing_dependency() {
        let chain: Chain<&str> = vec!["a", "b", "c"].into_iter().collect();
        let edges: Vec<_> = chain
            .stages()
            .iter()
            .map(|stage| (stage.item, stage.after.map(|after| chain.stages()[after.0].item)))
            .collect();
        assert_eq!(edges, vec![("a", None), ("b", Some("a")), ("c", Some("b"))]);
    }

    #[tokio::test]
    async fn test_run_stops_at_first_failure() {
        let chain = Chain::new().then(1).then(2).then(3);
        let visited = Mutex::new(Vec::new());

        let result: Result<Vec<()>, String> = chain
            .run(|item| {
                visited.lock().unwrap().push(*item);
                let item = *item;
                async move {
                    if item == 2 {
                        Err(format!("stage {} failed", item))
                    } else {
                        Ok(())
                    }
                }
            })
            .await;

        assert_eq!(result, Err("stage 2 failed".to_string()));
        assert_eq!(*visited.lock().unwrap(), vec![1, 2]);
    }
}

use std::sync::Arc;

use serde_json::Value;

/// Maps a logical event name (plus optional subscription context) to a channel name.
pub type TriggerTransform = Arc<dyn Fn(&str, Option<&Value>) -> String + Send + Sync>;

pub(crate) fn identity() -> TriggerTransform {
    Arc::new(|trigger: &str, _: Option<&Value>| trigger.to_string())
}

/// One or more logical event names.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Triggers(Vec<String>);

impl Triggers {
    /// Iterates the logical names in the order they were given.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    /// Resolves every name through `transform`, returning `(trigger, channel)`
    /// pairs. Names that resolve to an already-listed channel are skipped.
    pub fn resolve(
        &self,
        transform: &TriggerTransform,
        context: Option<&Value>,
    ) -> Vec<(String, String)> {
        let mut resolved: Vec<(String, String)> = Vec::with_capacity(self.0.len());

        for trigger in &self.0 {
            let channel = transform(trigger, context);
            if !resolved.iter().any(|(_, existing)| *existing == channel) {
                resolved.push((trigger.clone(), channel));
            }
        }

        resolved
    }
}

impl From<&str> for Triggers {
    fn from(trigger: &str) -> Self {
        Self(vec![trigger.to_string()])
    }
}

impl From<String> for Triggers {
    fn from(trigger: String) -> Self {
        Self(vec![trigger])
    }
}

impl From<Vec<String>> for Triggers {
    fn from(triggers: Vec<String>) -> Self {
        Self(triggers)
    }
}

impl From<Vec<&str>> for Triggers {
    fn from(triggers: Vec<&str>) -> Self {
        triggers.as_slice().into()
    }
}

impl From<&[&str]> for Triggers {
    fn from(triggers: &[&str]) -> Self {
        Self(triggers.iter().map(ToString::to_string).collect())
    }
}

impl<const N: usize> From<[&str; N]> for Triggers {
    fn from(triggers: [&str; N]) -> Self {
        triggers.as_slice().into()
    }
}

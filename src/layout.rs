use std::fmt;

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{MuxError, Result};

/// One labeled tab: a working directory and the shell command started in it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TabSpec {
    pub name: String,
    pub cwd: String,
    pub command: String,
}

impl TabSpec {
    pub fn new(name: impl Into<String>, cwd: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cwd: cwd.into(),
            command: command.into(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(MuxError::Validation(format!(
                "invalid tab name: {:?}",
                self.name
            )));
        }
        if self.command.trim().is_empty() {
            return Err(MuxError::Validation(format!(
                "invalid command for tab '{}': {:?}",
                self.name, self.command
            )));
        }
        if self.cwd.trim().is_empty() {
            return Err(MuxError::Validation(format!(
                "invalid cwd for tab '{}': {:?}",
                self.name, self.cwd
            )));
        }
        Ok(())
    }
}

/// The tabs of one session, in insertion order.
///
/// Construction does not validate; [`LayoutSpec::validate`] runs before any
/// artifact is generated so that a bad layout never reaches the disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayoutSpec {
    session_name: String,
    tabs: Vec<TabSpec>,
}

impl LayoutSpec {
    pub fn new(session_name: impl Into<String>) -> Self {
        Self {
            session_name: session_name.into(),
            tabs: Vec::new(),
        }
    }

    pub fn with_tabs(session_name: impl Into<String>, tabs: Vec<TabSpec>) -> Self {
        let mut layout = Self::new(session_name);
        for tab in tabs {
            layout.insert(tab);
        }
        layout
    }

    /// Build from `(name, cwd, command)` triples.
    pub fn from_triples<'a>(
        session_name: impl Into<String>,
        triples: impl IntoIterator<Item = (&'a str, &'a str, &'a str)>,
    ) -> Self {
        let mut layout = Self::new(session_name);
        for (name, cwd, command) in triples {
            layout.insert(TabSpec::new(name, cwd, command));
        }
        layout
    }

    /// Insert a tab; a tab with the same name is replaced in place, keeping its position.
    pub fn insert(&mut self, tab: TabSpec) {
        match self.tabs.iter_mut().find(|t| t.name == tab.name) {
            Some(existing) => *existing = tab,
            None => self.tabs.push(tab),
        }
    }

    pub fn session_name(&self) -> &str {
        &self.session_name
    }

    pub fn tabs(&self) -> &[TabSpec] {
        &self.tabs
    }

    pub fn tab(&self, name: &str) -> Option<&TabSpec> {
        self.tabs.iter().find(|t| t.name == name)
    }

    pub fn tab_names(&self) -> Vec<&str> {
        self.tabs.iter().map(|t| t.name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.tabs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tabs.is_empty()
    }

    /// Same tabs under a different session name.
    pub fn renamed(&self, session_name: impl Into<String>) -> Self {
        Self {
            session_name: session_name.into(),
            tabs: self.tabs.clone(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.tabs.is_empty() {
            return Err(MuxError::Validation(format!(
                "tab configuration for session '{}' cannot be empty",
                self.session_name
            )));
        }
        for (i, tab) in self.tabs.iter().enumerate() {
            tab.validate()?;
            if self.tabs[..i].iter().any(|t| t.name == tab.name) {
                return Err(MuxError::Validation(format!(
                    "duplicate tab name '{}'",
                    tab.name
                )));
            }
        }
        Ok(())
    }
}

/// `{tabName: [cwd, command]}` encoding of an ordered tab list.
///
/// Use with `#[serde(with = "crate::layout::tab_map")]` on a `Vec<TabSpec>`.
pub mod tab_map {
    use super::*;

    pub fn serialize<S: Serializer>(tabs: &[TabSpec], serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(tabs.len()))?;
        for tab in tabs {
            map.serialize_entry(&tab.name, &(&tab.cwd, &tab.command))?;
        }
        map.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Vec<TabSpec>, D::Error> {
        deserializer.deserialize_map(TabMapVisitor)
    }

    struct TabMapVisitor;

    impl<'de> Visitor<'de> for TabMapVisitor {
        type Value = Vec<TabSpec>;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a map of tab name to [cwd, command]")
        }

        fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> std::result::Result<Self::Value, A::Error> {
            let mut layout = LayoutSpec::new("");
            while let Some((name, (cwd, command))) = access.next_entry::<String, (String, String)>()? {
                layout.insert(TabSpec::new(name, cwd, command));
            }
            Ok(layout.tabs)
        }
    }
}

/// Ordered `{sessionName -> LayoutSpec}` map shared by a manager.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionLayouts {
    layouts: Vec<LayoutSpec>,
}

impl SessionLayouts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the layout for `layout.session_name()`.
    pub fn insert(&mut self, layout: LayoutSpec) {
        match self
            .layouts
            .iter_mut()
            .find(|l| l.session_name == layout.session_name)
        {
            Some(existing) => *existing = layout,
            None => self.layouts.push(layout),
        }
    }

    pub fn get(&self, session_name: &str) -> Option<&LayoutSpec> {
        self.layouts.iter().find(|l| l.session_name == session_name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &LayoutSpec> {
        self.layouts.iter()
    }

    pub fn names(&self) -> Vec<String> {
        self.layouts.iter().map(|l| l.session_name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.layouts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layouts.is_empty()
    }
}

impl FromIterator<LayoutSpec> for SessionLayouts {
    fn from_iter<I: IntoIterator<Item = LayoutSpec>>(iter: I) -> Self {
        let mut layouts = SessionLayouts::new();
        for layout in iter {
            layouts.insert(layout);
        }
        layouts
    }
}

struct TabsRef<'a>(&'a [TabSpec]);

impl Serialize for TabsRef<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        tab_map::serialize(self.0, serializer)
    }
}

struct TabsOwned(Vec<TabSpec>);

impl<'de> Deserialize<'de> for TabsOwned {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        tab_map::deserialize(deserializer).map(TabsOwned)
    }
}

impl Serialize for SessionLayouts {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.layouts.len()))?;
        for layout in &self.layouts {
            map.serialize_entry(&layout.session_name, &TabsRef(&layout.tabs))?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for SessionLayouts {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct SessionsVisitor;

        impl<'de> Visitor<'de> for SessionsVisitor {
            type Value = SessionLayouts;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of session name to tab map")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> std::result::Result<Self::Value, A::Error> {
                let mut layouts = SessionLayouts::new();
                while let Some((name, TabsOwned(tabs))) = access.next_entry::<String, TabsOwned>()? {
                    layouts.insert(LayoutSpec::with_tabs(name, tabs));
                }
                Ok(layouts)
            }
        }

        deserializer.deserialize_map(SessionsVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ci_layout() -> LayoutSpec {
        LayoutSpec::from_triples(
            "ci",
            [("build", "~/proj", "make"), ("watch", "~/proj", "tail -f log")],
        )
    }

    #[test]
    fn valid_layout_passes() {
        assert!(ci_layout().validate().is_ok());
    }

    #[test]
    fn empty_layout_is_rejected() {
        let err = LayoutSpec::new("ci").validate().unwrap_err();
        assert!(matches!(err, MuxError::Validation(_)));
        assert!(err.to_string().contains("cannot be empty"));
    }

    #[test]
    fn blank_fields_are_rejected() {
        for (name, cwd, command) in [("  ", "~", "htop"), ("t", "", "htop"), ("t", "~", " \t")] {
            let layout = LayoutSpec::from_triples("s", [(name, cwd, command)]);
            assert!(
                matches!(layout.validate(), Err(MuxError::Validation(_))),
                "({name:?}, {cwd:?}, {command:?}) should be invalid"
            );
        }
    }

    #[test]
    fn insert_replaces_in_place() {
        let mut layout = ci_layout();
        layout.insert(TabSpec::new("build", "/src", "cargo build"));
        assert_eq!(layout.tab_names(), vec!["build", "watch"]);
        assert_eq!(layout.tab("build").unwrap().command, "cargo build");
    }

    #[test]
    fn tab_map_json_keeps_insertion_order() {
        let mut layouts = SessionLayouts::new();
        layouts.insert(LayoutSpec::from_triples(
            "zeta",
            [("z", "/", "top"), ("a", "/", "htop"), ("m", "/var/log", "tail -f syslog")],
        ));
        layouts.insert(ci_layout());

        let json = serde_json::to_string(&layouts).unwrap();
        assert_eq!(
            json,
            r#"{"zeta":{"z":["/","top"],"a":["/","htop"],"m":["/var/log","tail -f syslog"]},"ci":{"build":["~/proj","make"],"watch":["~/proj","tail -f log"]}}"#
        );

        let back: SessionLayouts = serde_json::from_str(&json).unwrap();
        assert_eq!(back, layouts);
        assert_eq!(back.names(), vec!["zeta", "ci"]);
        assert_eq!(back.get("zeta").unwrap().tab_names(), vec!["z", "a", "m"]);
    }

    #[test]
    fn tab_map_rejects_wrong_shape() {
        let result = serde_json::from_str::<SessionLayouts>(r#"{"ci":{"build":"make"}}"#);
        assert!(result.is_err());
    }

    #[test]
    fn renamed_keeps_tabs() {
        let renamed = ci_layout().renamed("team_ci");
        assert_eq!(renamed.session_name(), "team_ci");
        assert_eq!(renamed.tabs(), ci_layout().tabs());
    }
}

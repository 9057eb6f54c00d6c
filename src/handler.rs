use crate::koji::TagDispatcher;
use crate::matcher::RuleEngine;
use crate::mbs::ModulemdSource;

use anyhow::Context;
use serde::Deserialize;
use serde_yaml::Value;

/// A module build reaching its ready state, as published on the message bus.
#[derive(Debug, Clone, Deserialize)]
pub struct BuildEvent {
    pub name: String,
    pub stream: String,
    pub version: String,
    pub context: String,
}

impl BuildEvent {
    /// The four-part build identifier used in logs and MBS lookups.
    pub fn nsvc(&self) -> String {
        format!(
            "{}-{}-{}-{}",
            self.name, self.stream, self.version, self.context
        )
    }

    /// The build identifier koji knows this build by. Streams may carry
    /// dashes, which the release field of an NVR cannot, so they become
    /// underscores.
    pub fn nvr(&self) -> String {
        let stream = self.stream.replace('-', "_");
        format!("{}-{}-{}.{}", self.name, stream, self.version, self.context)
    }
}

/// Per-event orchestration: fetch modulemd, evaluate the rule set, tag the
/// build. Stateless across events.
pub struct EventHandler<S, D> {
    engine: RuleEngine,
    source: S,
    dispatcher: D,
    dry_run: bool,
}

impl<S, D> EventHandler<S, D>
where
    S: ModulemdSource,
    D: TagDispatcher,
{
    pub fn new(engine: RuleEngine, source: S, dispatcher: D, dry_run: bool) -> Self {
        EventHandler {
            engine,
            source,
            dispatcher,
            dry_run,
        }
    }

    /// Handle one build event. A retrieval failure drops the event and
    /// returns Ok so the service keeps consuming; a malformed modulemd
    /// surfaces as an error.
    pub async fn handle(&self, event: &BuildEvent) -> anyhow::Result<()> {
        let nsvc = event.nsvc();

        let content = match self
            .source
            .fetch_modulemd(&event.name, &event.stream, &event.version, &event.context)
            .await
        {
            Ok(content) => content,
            Err(e) => {
                // Keep serving later builds; bus redelivery, if any, is the
                // transport's business.
                log::error!("Failed to retrieve modulemd for {nsvc}: {e}");
                return Ok(());
            }
        };

        let modulemd: Value = serde_yaml::from_str(&content)
            .with_context(|| format!("malformed modulemd for {nsvc}"))?;
        let has_data = modulemd
            .as_mapping()
            .map(|mapping| mapping.iter().any(|(key, _)| key.as_str() == Some("data")))
            .unwrap_or(false);
        if !has_data {
            anyhow::bail!("modulemd for {nsvc} has no data section");
        }
        log::debug!("Modulemd file is downloaded and parsed");

        let tags = self.engine.evaluate(&modulemd);
        if tags.is_empty() {
            log::info!("Module build {nsvc} does not match any rule");
            return Ok(());
        }

        let nvr = event.nvr();
        log::debug!("Tag build {} with tag(s) {}", nvr, tags.join(", "));
        if self.dry_run {
            log::info!("DRY-RUN: tag build nvr: {nvr}, destination tags: {tags:?}");
            return Ok(());
        }

        let session = self
            .dispatcher
            .open_session()
            .await
            .context("could not open a koji session")?;
        for tag in &tags {
            // One tag failing must not keep the rest from being applied.
            if let Err(e) = self.dispatcher.tag_build(&session, tag, &nvr).await {
                log::error!("Failed to tag {tag} to build {nvr}: {e}");
            }
        }
        self.dispatcher.close_session(session).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::koji::DispatchError;
    use crate::mbs::RetrievalError;
    use crate::rules::parse_rules;

    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct CannedSource {
        modulemd: Result<String, ()>,
    }

    #[async_trait]
    impl ModulemdSource for CannedSource {
        async fn fetch_modulemd(
            &self,
            name: &str,
            _stream: &str,
            _version: &str,
            _context: &str,
        ) -> Result<String, RetrievalError> {
            self.modulemd
                .clone()
                .map_err(|_| RetrievalError::NoSuchBuild {
                    nsvc: name.to_string(),
                })
        }
    }

    #[derive(Default)]
    struct RecordingDispatcher {
        tagged: Mutex<Vec<(String, String)>>,
        fail_on: Option<String>,
        sessions_opened: AtomicUsize,
        sessions_closed: AtomicUsize,
    }

    #[async_trait]
    impl TagDispatcher for &RecordingDispatcher {
        type Session = ();

        async fn open_session(&self) -> Result<(), DispatchError> {
            self.sessions_opened.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn tag_build(
            &self,
            _session: &(),
            tag: &str,
            nvr: &str,
        ) -> Result<(), DispatchError> {
            if self.fail_on.as_deref() == Some(tag) {
                return Err(DispatchError::Fault {
                    code: 1000,
                    message: "policy violation".to_string(),
                });
            }
            self.tagged
                .lock()
                .unwrap()
                .push((tag.to_string(), nvr.to_string()));
            Ok(())
        }

        async fn close_session(&self, _session: ()) {
            self.sessions_closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn event() -> BuildEvent {
        BuildEvent {
            name: "ruby".to_string(),
            stream: "2.6".to_string(),
            version: "20190101".to_string(),
            context: "abcd1234".to_string(),
        }
    }

    fn handler<'a>(
        rules_yaml: &str,
        modulemd: Result<String, ()>,
        dispatcher: &'a RecordingDispatcher,
        dry_run: bool,
    ) -> EventHandler<CannedSource, &'a RecordingDispatcher> {
        let engine = RuleEngine::new(parse_rules(rules_yaml).unwrap()).unwrap();
        EventHandler::new(engine, CannedSource { modulemd }, dispatcher, dry_run)
    }

    const MATCH_ALL_RULES: &str = r#"
- id: catch-all
  type: module
  destinations: modular-updates-candidate
"#;

    #[tokio::test]
    async fn test_matched_build_is_tagged() {
        let dispatcher = RecordingDispatcher::default();
        let handler = handler(
            MATCH_ALL_RULES,
            Ok("data:\n  name: ruby".to_string()),
            &dispatcher,
            false,
        );
        handler.handle(&event()).await.unwrap();
        assert_eq!(
            *dispatcher.tagged.lock().unwrap(),
            [(
                "modular-updates-candidate".to_string(),
                "ruby-2.6-20190101.abcd1234".to_string()
            )]
        );
        assert_eq!(dispatcher.sessions_opened.load(Ordering::SeqCst), 1);
        assert_eq!(dispatcher.sessions_closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stream_dashes_become_underscores_in_nvr() {
        let dispatcher = RecordingDispatcher::default();
        let handler = handler(
            MATCH_ALL_RULES,
            Ok("data:\n  name: ruby".to_string()),
            &dispatcher,
            false,
        );
        let mut event = event();
        event.stream = "2.6-beta".to_string();
        handler.handle(&event).await.unwrap();
        assert_eq!(
            dispatcher.tagged.lock().unwrap()[0].1,
            "ruby-2.6_beta-20190101.abcd1234"
        );
    }

    #[tokio::test]
    async fn test_no_match_never_touches_the_dispatcher() {
        let dispatcher = RecordingDispatcher::default();
        let handler = handler(
            r#"
- id: nodejs-only
  type: module
  rule:
    name: '^nodejs$'
  destinations: tag
"#,
            Ok("data:\n  name: ruby".to_string()),
            &dispatcher,
            false,
        );
        handler.handle(&event()).await.unwrap();
        assert!(dispatcher.tagged.lock().unwrap().is_empty());
        assert_eq!(dispatcher.sessions_opened.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_dry_run_computes_tags_but_never_dispatches() {
        let dispatcher = RecordingDispatcher::default();
        let handler = handler(
            MATCH_ALL_RULES,
            Ok("data:\n  name: ruby".to_string()),
            &dispatcher,
            true,
        );
        handler.handle(&event()).await.unwrap();
        assert!(dispatcher.tagged.lock().unwrap().is_empty());
        assert_eq!(dispatcher.sessions_opened.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_retrieval_failure_drops_the_event_without_error() {
        let dispatcher = RecordingDispatcher::default();
        let handler = handler(MATCH_ALL_RULES, Err(()), &dispatcher, false);
        assert!(handler.handle(&event()).await.is_ok());
        assert_eq!(dispatcher.sessions_opened.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_malformed_modulemd_surfaces_as_error() {
        let dispatcher = RecordingDispatcher::default();
        let handler = handler(
            MATCH_ALL_RULES,
            Ok("data: [unbalanced".to_string()),
            &dispatcher,
            false,
        );
        assert!(handler.handle(&event()).await.is_err());
    }

    #[tokio::test]
    async fn test_modulemd_without_data_section_is_an_error() {
        let dispatcher = RecordingDispatcher::default();
        let handler = handler(
            MATCH_ALL_RULES,
            Ok("document: wrong".to_string()),
            &dispatcher,
            false,
        );
        assert!(handler.handle(&event()).await.is_err());
    }

    #[tokio::test]
    async fn test_one_tag_failing_does_not_stop_the_rest() {
        let dispatcher = RecordingDispatcher {
            fail_on: Some("tag-one".to_string()),
            ..Default::default()
        };
        let handler = handler(
            r#"
- id: multi
  type: module
  destinations:
    - tag-one
    - tag-two
"#,
            Ok("data:\n  name: ruby".to_string()),
            &dispatcher,
            false,
        );
        handler.handle(&event()).await.unwrap();
        let tagged = dispatcher.tagged.lock().unwrap();
        assert_eq!(tagged.len(), 1);
        assert_eq!(tagged[0].0, "tag-two");
        assert_eq!(dispatcher.sessions_closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_two_matching_rules_tag_in_rule_order() {
        let dispatcher = RecordingDispatcher::default();
        let handler = handler(
            r#"
- id: first
  type: module
  rule:
    name: ruby
  destinations: tag-one
- id: second
  type: module
  destinations: tag-two
"#,
            Ok("data:\n  name: ruby".to_string()),
            &dispatcher,
            false,
        );
        handler.handle(&event()).await.unwrap();
        let tags: Vec<String> = dispatcher
            .tagged
            .lock()
            .unwrap()
            .iter()
            .map(|(tag, _)| tag.clone())
            .collect();
        assert_eq!(tags, ["tag-one", "tag-two"]);
    }
}

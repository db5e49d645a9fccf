//! Trigger events and the matching rules for automation filters.

use regex::Regex;

use ariana_types::{Automation, AutomationId, TriggerType};

use crate::compile_filter;

/// One occurrence of a lifecycle hook, with the context filters match on.
#[derive(Debug, Clone, Default)]
pub struct TriggerEvent {
    /// The hook that fired.
    pub trigger: TriggerType,
    /// Files touched, for `on_after_read_files` / `on_after_edit_files`.
    pub files: Vec<String>,
    /// Command line, for `on_after_run_command`.
    pub command: Option<String>,
    /// Finished automation, for `on_automation_finishes`.
    pub finished_automation: Option<AutomationId>,
}

impl TriggerEvent {
    /// A bare lifecycle hook with no filterable context.
    pub fn lifecycle(trigger: TriggerType) -> Self {
        Self { trigger, ..Default::default() }
    }

    /// A file-touching tool hook.
    pub fn files(trigger: TriggerType, files: Vec<String>) -> Self {
        Self { trigger, files, ..Default::default() }
    }

    /// A command execution hook.
    pub fn command(command: String) -> Self {
        Self {
            trigger: TriggerType::OnAfterRunCommand,
            command: Some(command),
            ..Default::default()
        }
    }

    /// Another automation finished.
    pub fn automation_finished(id: AutomationId) -> Self {
        Self {
            trigger: TriggerType::OnAutomationFinishes,
            finished_automation: Some(id),
            ..Default::default()
        }
    }
}

/// Whether an automation's filters accept a trigger event. The trigger
/// types are assumed equal; callers query storage by type first.
pub fn matches_trigger(automation: &Automation, event: &TriggerEvent) -> bool {
    let trigger = &automation.trigger;

    if let Some(glob) = &trigger.file_glob {
        match glob_to_regex(glob) {
            Some(re) => {
                if !event.files.iter().any(|f| re.is_match(f)) {
                    return false;
                }
            }
            None => return false,
        }
    }

    if let Some(pattern) = &trigger.command_regex {
        match (&event.command, compile_filter(pattern)) {
            (Some(command), Some(re)) => {
                if !re.is_match(command) {
                    return false;
                }
            }
            _ => return false,
        }
    }

    if let Some(wanted) = trigger.automation_id {
        if event.finished_automation != Some(wanted) {
            return false;
        }
    }

    true
}

/// Translate a file glob to an anchored regex.
///
/// `**` crosses directory separators, `*` and `?` do not; everything else
/// is literal. An invalid result (pathological escapes) yields `None` and
/// the filter matches nothing.
pub fn glob_to_regex(glob: &str) -> Option<Regex> {
    let mut pattern = String::with_capacity(glob.len() + 8);
    pattern.push('^');
    let mut chars = glob.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => {
                if chars.peek() == Some(&'*') {
                    chars.next();
                    if chars.peek() == Some(&'/') {
                        chars.next();
                        // `**/` also matches zero directories.
                        pattern.push_str("(?:.*/)?");
                    } else {
                        pattern.push_str(".*");
                    }
                } else {
                    pattern.push_str("[^/]*");
                }
            }
            '?' => pattern.push_str("[^/]"),
            other => pattern.push_str(&regex::escape(&other.to_string())),
        }
    }
    pattern.push('$');
    Regex::new(&pattern).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ariana_types::{AutomationTrigger, ProjectId, ScriptLanguage, UserId};

    fn automation(trigger: AutomationTrigger) -> Automation {
        Automation {
            id: AutomationId::new(),
            project_id: ProjectId::new(),
            user_id: UserId::new(),
            name: "check".into(),
            trigger,
            script_language: ScriptLanguage::Bash,
            script_content: "true".into(),
            blocking: false,
            feed_output: false,
        }
    }

    fn trigger(trigger_type: TriggerType) -> AutomationTrigger {
        AutomationTrigger { trigger_type, file_glob: None, command_regex: None, automation_id: None }
    }

    #[test]
    fn star_does_not_cross_directories() {
        let re = glob_to_regex("src/*.rs").unwrap();
        assert!(re.is_match("src/lib.rs"));
        assert!(!re.is_match("src/nested/mod.rs"));
        assert!(!re.is_match("lib.rs"));
    }

    #[test]
    fn double_star_crosses_directories() {
        let re = glob_to_regex("**/*.rs").unwrap();
        assert!(re.is_match("lib.rs"));
        assert!(re.is_match("src/deep/inner/mod.rs"));
        assert!(!re.is_match("src/main.py"));
    }

    #[test]
    fn question_mark_is_single_segment_char() {
        let re = glob_to_regex("file?.txt").unwrap();
        assert!(re.is_match("file1.txt"));
        assert!(!re.is_match("file10.txt"));
        assert!(!re.is_match("file/.txt"));
    }

    #[test]
    fn literal_dots_are_escaped() {
        let re = glob_to_regex("Cargo.toml").unwrap();
        assert!(re.is_match("Cargo.toml"));
        assert!(!re.is_match("Cargoxtoml"));
    }

    #[test]
    fn file_glob_filter_needs_one_matching_file() {
        let mut t = trigger(TriggerType::OnAfterEditFiles);
        t.file_glob = Some("src/**/*.rs".into());
        let automation = automation(t);

        let hit = TriggerEvent::files(
            TriggerType::OnAfterEditFiles,
            vec!["README.md".into(), "src/api/mod.rs".into()],
        );
        assert!(matches_trigger(&automation, &hit));

        let miss =
            TriggerEvent::files(TriggerType::OnAfterEditFiles, vec!["README.md".into()]);
        assert!(!matches_trigger(&automation, &miss));
    }

    #[test]
    fn command_regex_filter() {
        let mut t = trigger(TriggerType::OnAfterRunCommand);
        t.command_regex = Some(r"^cargo (test|check)".into());
        let automation = automation(t);

        assert!(matches_trigger(&automation, &TriggerEvent::command("cargo test --all".into())));
        assert!(!matches_trigger(&automation, &TriggerEvent::command("cargo build".into())));
        // A file event carries no command; the filter rejects it.
        assert!(!matches_trigger(
            &automation,
            &TriggerEvent::lifecycle(TriggerType::OnAfterRunCommand)
        ));
    }

    #[test]
    fn automation_id_filter() {
        let upstream = AutomationId::new();
        let mut t = trigger(TriggerType::OnAutomationFinishes);
        t.automation_id = Some(upstream);
        let automation = automation(t);

        assert!(matches_trigger(&automation, &TriggerEvent::automation_finished(upstream)));
        assert!(!matches_trigger(
            &automation,
            &TriggerEvent::automation_finished(AutomationId::new())
        ));
    }

    #[test]
    fn no_filters_matches_everything() {
        let automation = automation(trigger(TriggerType::OnAgentReady));
        assert!(matches_trigger(&automation, &TriggerEvent::lifecycle(TriggerType::OnAgentReady)));
    }

    #[test]
    fn invalid_regex_matches_nothing() {
        let mut t = trigger(TriggerType::OnAfterRunCommand);
        t.command_regex = Some("(unclosed".into());
        let automation = automation(t);
        assert!(!matches_trigger(&automation, &TriggerEvent::command("anything".into())));
    }
}

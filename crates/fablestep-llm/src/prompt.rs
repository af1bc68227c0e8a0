//! Chat message construction.

use std::fmt::Write as _;

use fablestep_core::step::RouteDisposition;
use fablestep_narrative::domain::mapper::{MappedTargetType, MappingRequest};
use fablestep_narrative::domain::narrator::{EpilogueRequest, NarrationRequest};
use serde::Serialize;

/// One chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub(crate) struct ChatMessage {
    pub role: &'static str,
    pub content: String,
}

impl ChatMessage {
    fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system",
            content: content.into(),
        }
    }

    fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user",
            content: content.into(),
        }
    }
}

const MAPPER_SYSTEM: &str = "You map a player's free-text action in an interactive story to \
exactly one target from an allow-list. Answer with a single JSON object and nothing else: \
{\"target_type\": \"choice\" | \"intent\", \"target_id\": string, \
\"confidence\": number between 0 and 1, \
\"intensity_tier\": integer between -2 and 2, \"policy_flagged\": boolean}. \
Never invent a target_id that is not in the allow-list.";

const NARRATOR_SYSTEM: &str = "You narrate one step of an interactive story in second person, \
present tense, in two to four sentences. Describe what happens and where the player ends up. \
Never mention identifiers, game mechanics or numbers.";

const EPILOGUE_SYSTEM: &str = "You write the closing epilogue of an interactive story in one short \
paragraph, second person, past tense. Never mention identifiers or game mechanics.";

pub(crate) fn mapping_messages(request: &MappingRequest) -> Vec<ChatMessage> {
    let mut user = format!("Scene:\n{}\n\nAllow-list:\n", request.scene);
    for target in &request.allow_list {
        let kind = match target.target_type {
            MappedTargetType::Choice => "choice",
            MappedTargetType::Intent => "intent",
        };
        let _ = writeln!(user, "- {kind} {}: {}", target.target_id, target.hint);
    }
    let _ = write!(user, "\nPlayer: {}", request.player_input);
    if let Some(previous) = &request.previous_error {
        let _ = write!(
            user,
            "\n\nYour previous answer was rejected ({previous}). \
             Answer with valid JSON naming an allow-list entry."
        );
    }
    vec![ChatMessage::system(MAPPER_SYSTEM), ChatMessage::user(user)]
}

pub(crate) fn narration_messages(request: &NarrationRequest) -> Vec<ChatMessage> {
    let mut user = format!(
        "Story: {}\nScene: {}\nPlayer action: {}\n",
        request.story_title, request.scene, request.action_label
    );
    match request.disposition {
        RouteDisposition::Executed => {}
        RouteDisposition::Rerouted => {
            user.push_str(
                "The action could not be carried out as intended; \
                 something else happened instead.\n",
            );
        }
        RouteDisposition::Degraded => {
            user.push_str("The action failed and the player stays where they are.\n");
        }
    }
    if let Some(input) = &request.player_input {
        let _ = writeln!(user, "The player said: {input}");
    }
    for (stat, change) in &request.stat_changes {
        let direction = if *change >= 0 { "rose" } else { "fell" };
        let _ = writeln!(user, "The player's {stat} {direction}.");
    }
    if let Some(event) = &request.event_text {
        let _ = writeln!(user, "Meanwhile: {event}");
    }
    let _ = write!(user, "Next scene: {}", request.next_scene);
    vec![ChatMessage::system(NARRATOR_SYSTEM), ChatMessage::user(user)]
}

pub(crate) fn epilogue_messages(request: &EpilogueRequest) -> Vec<ChatMessage> {
    let mut user = format!(
        "Story: {}\nEnding: {} ({})\n",
        request.story_title, request.ending_title, request.outcome
    );
    if request.forced_by_timeout {
        user.push_str("The story ran out of time before the player chose an ending.\n");
    }
    for note in &request.recap {
        let _ = writeln!(user, "- {note}");
    }
    vec![ChatMessage::system(EPILOGUE_SYSTEM), ChatMessage::user(user)]
}

#[cfg(test)]
mod tests {
    use fablestep_narrative::domain::mapper::AllowedTarget;

    use super::*;

    fn mapping_request(previous_error: Option<&str>) -> MappingRequest {
        MappingRequest {
            story_id: "lantern-keep".into(),
            node_id: "gate".into(),
            scene: "The Gate. A barred gate.".into(),
            player_input: "I bang on the gate".into(),
            allow_list: vec![AllowedTarget {
                target_type: MappedTargetType::Choice,
                target_id: "knock".into(),
                hint: "Knock on the gate".into(),
            }],
            attempt: 1,
            previous_error: previous_error.map(str::to_owned),
        }
    }

    #[test]
    fn test_mapping_prompt_lists_allowed_targets() {
        let messages = mapping_messages(&mapping_request(None));

        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, "system");
        assert!(messages[1].content.contains("- choice knock: Knock on the gate"));
        assert!(messages[1].content.ends_with("Player: I bang on the gate"));
    }

    #[test]
    fn test_mapping_retry_prompt_names_previous_failure() {
        let messages = mapping_messages(&mapping_request(Some("MALFORMED_OUTPUT")));

        assert!(messages[1].content.contains("rejected (MALFORMED_OUTPUT)"));
    }

    #[test]
    fn test_narration_prompt_describes_degraded_steps() {
        let request = NarrationRequest {
            story_title: "Lantern Keep".into(),
            scene: "The Gate.".into(),
            next_scene: "The Gate.".into(),
            action_label: "Bribe the keeper".into(),
            disposition: RouteDisposition::Degraded,
            player_input: None,
            stat_changes: vec![("resolve".into(), -1)],
            event_text: None,
        };

        let messages = narration_messages(&request);

        assert!(messages[1].content.contains("stays where they are"));
        assert!(messages[1].content.contains("resolve fell"));
    }
}

//! Linear issue tracker client over its GraphQL API.
//!
//! The API key and the per-team workflow-state cache live on the client
//! instance, scoped to the orchestrator that constructed it.

use std::collections::HashMap;

use anyhow::{Context, Result, anyhow, bail};
use serde_json::{Value, json};
use tokio::sync::Mutex;

const API_URL: &str = "https://api.linear.app/graphql";

#[derive(Debug, Clone)]
pub struct Issue {
    pub id: String,
    pub title: String,
    pub state: String,
    pub priority: i64,
    pub url: Option<String>,
}

#[derive(Debug, Clone)]
struct WorkflowState {
    id: String,
    name: String,
    kind: String,
}

pub struct LinearClient {
    api_key: String,
    http: reqwest::Client,
    state_cache: Mutex<HashMap<String, Vec<WorkflowState>>>,
}

impl LinearClient {
    pub fn new(api_key: String, http: reqwest::Client) -> Self {
        Self {
            api_key,
            http,
            state_cache: Mutex::new(HashMap::new()),
        }
    }

    async fn gql(&self, query: &str, variables: Value) -> Result<Value> {
        let response = self
            .http
            .post(API_URL)
            .header("Authorization", &self.api_key)
            .json(&json!({ "query": query, "variables": variables }))
            .send()
            .await
            .context("Linear API request failed")?;
        if !response.status().is_success() {
            bail!("Linear API {}", response.status());
        }
        let body: Value = response
            .json()
            .await
            .context("Linear API returned invalid JSON")?;
        if let Some(message) = body
            .pointer("/errors/0/message")
            .and_then(Value::as_str)
        {
            bail!("Linear API: {message}");
        }
        body.get("data")
            .cloned()
            .ok_or_else(|| anyhow!("Linear API response has no data"))
    }

    /// Issues assigned to the caller in the given state types, newest first.
    /// Failures degrade to an empty list — issue pickers must keep working
    /// when the tracker is down.
    pub async fn list_my_issues(&self, state_types: &[String], teams: &[String]) -> Vec<Issue> {
        let mut filter = json!({
            "assignee": { "isMe": { "eq": true } },
            "state": { "type": { "in": state_types } },
        });
        if !teams.is_empty() {
            filter["team"] = json!({ "key": { "in": teams } });
        }
        let result = self
            .gql(
                "query($filter: IssueFilter!) {
                  issues(filter: $filter, orderBy: updatedAt, first: 50) {
                    nodes { identifier title state { name type } priority }
                  }
                }",
                json!({ "filter": filter }),
            )
            .await;

        let Ok(data) = result else { return Vec::new() };
        data.pointer("/issues/nodes")
            .and_then(Value::as_array)
            .map(|nodes| nodes.iter().filter_map(parse_issue).collect())
            .unwrap_or_default()
    }

    pub async fn get_issue(&self, issue_id: &str) -> Option<Issue> {
        let data = self
            .gql(
                "query($id: String!) {
                  issue(id: $id) { identifier title state { name type } priority url }
                }",
                json!({ "id": issue_id }),
            )
            .await
            .ok()?;
        parse_issue(data.get("issue")?)
    }

    /// Create an issue assigned to the caller, auto-moved to the team's
    /// "started" state when one exists. Returns the new identifier.
    pub async fn create_issue(
        &self,
        title: &str,
        priority: Option<u8>,
        team_key: &str,
    ) -> Result<String> {
        let teams = self
            .gql(
                "query($key: String!) { teams(filter: { key: { eq: $key } }) { nodes { id } } }",
                json!({ "key": team_key }),
            )
            .await?;
        let team_id = teams
            .pointer("/teams/nodes/0/id")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("Linear team \"{team_key}\" not found"))?
            .to_string();

        let viewer = self.gql("query { viewer { id } }", json!({})).await?;
        let assignee_id = viewer
            .pointer("/viewer/id")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("could not resolve Linear viewer"))?
            .to_string();

        let mut input = json!({ "title": title, "teamId": team_id, "assigneeId": assignee_id });
        let states = self.workflow_states(team_key).await?;
        if let Some(started) = states.iter().find(|s| s.kind == "started") {
            input["stateId"] = json!(started.id);
        }
        if let Some(priority) = priority {
            input["priority"] = json!(priority);
        }

        let data = self
            .gql(
                "mutation($input: IssueCreateInput!) {
                  issueCreate(input: $input) { issue { identifier } }
                }",
                json!({ "input": input }),
            )
            .await?;
        data.pointer("/issueCreate/issue/identifier")
            .and_then(Value::as_str)
            .map(String::from)
            .ok_or_else(|| anyhow!("Linear did not return an issue identifier"))
    }

    /// Move an issue to the given workflow state, named either by its exact
    /// name ("In Review") or by its type ("started").
    pub async fn update_issue_state(&self, issue_id: &str, state: &str) -> Result<()> {
        let team = team_key(issue_id);
        let state_id = self.resolve_state_id(&team, state).await?;
        self.gql(
            "mutation($id: String!, $input: IssueUpdateInput!) {
              issueUpdate(id: $id, input: $input) { success }
            }",
            json!({ "id": issue_id, "input": { "stateId": state_id } }),
        )
        .await?;
        Ok(())
    }

    async fn workflow_states(&self, team_key: &str) -> Result<Vec<WorkflowState>> {
        let mut cache = self.state_cache.lock().await;
        if let Some(states) = cache.get(team_key) {
            return Ok(states.clone());
        }
        let data = self
            .gql(
                "query($teamKey: String!) {
                  workflowStates(filter: { team: { key: { eq: $teamKey } } }) {
                    nodes { id name type }
                  }
                }",
                json!({ "teamKey": team_key }),
            )
            .await?;
        let states: Vec<WorkflowState> = data
            .pointer("/workflowStates/nodes")
            .and_then(Value::as_array)
            .map(|nodes| {
                nodes
                    .iter()
                    .filter_map(|node| {
                        Some(WorkflowState {
                            id: node.get("id")?.as_str()?.to_string(),
                            name: node.get("name")?.as_str()?.to_string(),
                            kind: node.get("type")?.as_str()?.to_string(),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        cache.insert(team_key.to_string(), states.clone());
        Ok(states)
    }

    /// Exact name match wins (case-insensitive); state type is the fallback.
    async fn resolve_state_id(&self, team_key: &str, name_or_type: &str) -> Result<String> {
        let states = self.workflow_states(team_key).await?;
        let lower = name_or_type.to_lowercase();
        if let Some(state) = states.iter().find(|s| s.name.to_lowercase() == lower) {
            return Ok(state.id.clone());
        }
        if let Some(state) = states.iter().find(|s| s.kind == lower) {
            return Ok(state.id.clone());
        }
        bail!("unknown Linear state \"{name_or_type}\" for team {team_key}")
    }
}

/// Team key embedded in an issue identifier: "KAD-4828" → "KAD".
pub fn team_key(issue_id: &str) -> String {
    match issue_id.rsplit_once('-') {
        Some((team, number)) if !number.is_empty() && number.chars().all(|c| c.is_ascii_digit()) => {
            team.to_string()
        }
        _ => issue_id.to_string(),
    }
}

fn parse_issue(node: &Value) -> Option<Issue> {
    Some(Issue {
        id: node.get("identifier")?.as_str()?.to_string(),
        title: node.get("title")?.as_str()?.to_string(),
        state: node
            .pointer("/state/type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        priority: node.get("priority").and_then(Value::as_i64).unwrap_or(0),
        url: node.get("url").and_then(Value::as_str).map(String::from),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn team_key_strips_issue_number() {
        assert_eq!(team_key("KAD-4828"), "KAD");
        assert_eq!(team_key("ENG-1"), "ENG");
    }

    #[test]
    fn team_key_leaves_non_issue_ids_alone() {
        assert_eq!(team_key("no-number-here"), "no-number-here");
        assert_eq!(team_key("plain"), "plain");
    }

    #[test]
    fn parse_issue_reads_nested_state() {
        let node = json!({
            "identifier": "ENG-7",
            "title": "Fix flaky test",
            "state": { "name": "In Progress", "type": "started" },
            "priority": 2,
        });
        let issue = parse_issue(&node).unwrap();
        assert_eq!(issue.id, "ENG-7");
        assert_eq!(issue.state, "started");
        assert_eq!(issue.priority, 2);
        assert!(issue.url.is_none());
    }

    #[test]
    fn parse_issue_rejects_malformed_nodes() {
        assert!(parse_issue(&json!({ "title": "missing identifier" })).is_none());
    }
}

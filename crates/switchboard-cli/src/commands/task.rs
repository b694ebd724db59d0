//! `switchboard task` — Agent task commands.

use switchboard_core::models::payload::Payload;
use switchboard_core::models::task::{AgentRole, NewTask, TaskStatus, TaskType};
use switchboard_core::state::AppState;

use super::{parse_json_arg, print_value};

fn parse_agent(agent: &str) -> Result<AgentRole, String> {
    AgentRole::from_str(agent).ok_or_else(|| {
        let known: Vec<&str> = AgentRole::ALL.iter().map(|r| r.as_str()).collect();
        format!("Unknown agent '{}'. Known agents: {}", agent, known.join(", "))
    })
}

pub async fn list(
    state: &AppState,
    agent: Option<&str>,
    status: Option<&str>,
    limit: usize,
) -> Result<(), String> {
    let agent = agent.map(parse_agent).transpose()?;
    let status = status
        .map(|s| TaskStatus::from_str(s).ok_or_else(|| format!("Unknown task status '{}'", s)))
        .transpose()?;
    let tasks = state
        .task_queue
        .list(agent, status, limit)
        .await
        .map_err(|e| e.to_string())?;
    print_value(&tasks)
}

pub async fn pending(state: &AppState, agent: &str) -> Result<(), String> {
    let tasks = state
        .task_queue
        .fetch_pending(parse_agent(agent)?)
        .await
        .map_err(|e| e.to_string())?;
    print_value(&tasks)
}

pub async fn get(state: &AppState, task_id: &str) -> Result<(), String> {
    let task = state.task_queue.get(task_id).await.map_err(|e| e.to_string())?;
    print_value(&task)
}

pub async fn create(
    state: &AppState,
    agent: &str,
    task_type: &str,
    payload: &str,
    priority: u8,
    created_by: &str,
) -> Result<(), String> {
    let input = NewTask::new(
        parse_agent(agent)?,
        TaskType::parse(task_type),
        Payload::new(parse_json_arg("payload", payload)?),
    )
    .with_priority(priority)
    .created_by(created_by);

    let task = state.task_queue.create_task(input).await.map_err(|e| e.to_string())?;
    print_value(&task)
}

pub async fn complete(state: &AppState, task_id: &str, result: &str) -> Result<(), String> {
    let result = Payload::new(parse_json_arg("result", result)?);
    let task = state
        .task_queue
        .mark_complete(task_id, result)
        .await
        .map_err(|e| e.to_string())?;
    print_value(&task)
}

pub async fn fail(state: &AppState, task_id: &str, error: &str) -> Result<(), String> {
    let task = state
        .task_queue
        .mark_failed(task_id, error)
        .await
        .map_err(|e| e.to_string())?;
    print_value(&task)
}

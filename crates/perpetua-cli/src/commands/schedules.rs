// sync-schedules: reconcile schedule entries with agent life-state.
// Only ACTIVE agents may carry a schedule; violations are snapshotted and
// cleared so the scheduler backend stays consistent.

use crate::EXIT_OK;

pub async fn run() -> anyhow::Result<i32> {
    let stores = match super::connect().await? {
        Ok(stores) => stores,
        Err(code) => return Ok(code),
    };
    let db = stores.database();

    let fixed = db.clear_schedules_for_inactive().await?;
    let scheduled = db.count_scheduled_agents().await?;

    println!("schedule sync completed: {scheduled} scheduled agents, {fixed} stale entries cleared");
    Ok(EXIT_OK)
}

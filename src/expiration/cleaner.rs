use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::storage::Database;
use crate::AppState;

/// Start the background expiration cleaner task
pub fn start_expiration_cleaner(state: Arc<AppState>) -> JoinHandle<()> {
    let interval = Duration::from_secs(state.config.tokens.cleanup_interval_seconds.max(1));
    let db = state.store.database().clone();

    tokio::spawn(async move {
        let mut interval_timer = tokio::time::interval(interval);

        loop {
            interval_timer.tick().await;
            run_cleanup(&db).await;
        }
    })
}

/// Prune retired refresh hashes that can no longer match a live session.
pub async fn run_cleanup(db: &Database) -> usize {
    debug!("Running expiration cleanup");

    let db = db.clone();
    let result = tokio::task::spawn_blocking(move || db.prune_retired_hashes(Utc::now())).await;

    match result {
        Ok(Ok(count)) => {
            if count > 0 {
                debug!(retired_hashes_pruned = count, "Expired refresh hashes pruned");
            }
            count
        }
        Ok(Err(e)) => {
            error!(error = %e, "Failed to prune retired refresh hashes");
            0
        }
        Err(e) => {
            error!(error = %e, "Expiration cleanup task panicked");
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::models::{Actor, Role};
    use crate::testutil::{make_session, make_user, setup_db};
    use crate::tokens::hash_token;

    #[tokio::test]
    async fn test_cleanup_prunes_expired_sessions_only() {
        let (db, _temp) = setup_db();
        let user = make_user("u1", "a@example.com", Role::Agent, Some("org-1"));
        db.insert_user(&user, Actor::System, None).unwrap();

        let live = make_session("live", "u1");
        let mut stale = make_session("stale", "u1");
        stale.expires_at = Utc::now() + chrono::Duration::milliseconds(200);
        db.create_session(&live, Actor::System).unwrap();
        db.create_session(&stale, Actor::System).unwrap();

        for id in ["live", "stale"] {
            db.rotate_refresh_token(
                &hash_token(&format!("rt_{id}")),
                &hash_token(&format!("rt_{id}_next")),
                None,
                Utc::now(),
            )
            .unwrap();
        }

        assert_eq!(run_cleanup(&db).await, 0);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(run_cleanup(&db).await, 1);
        assert_eq!(run_cleanup(&db).await, 0);
    }
}

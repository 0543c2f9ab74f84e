//! Tests for `LedgerManager` bookkeeping.

use trio::ledger::{Channel, LedgerManager, LedgerStats, NewOperation, TransactionStatus};

#[tokio::test]
async fn finished_ledgers_move_into_history() {
    let manager = LedgerManager::new();

    let mut committed = manager.begin();
    committed
        .add_operation(Channel::Email, NewOperation::irreversible("e-1"))
        .expect("add");
    let mut rolled_back = manager.begin();
    assert_eq!(manager.active_count(), 2);

    committed.commit().expect("commit");
    manager.finish(&committed);
    rolled_back.rollback().await.expect("rollback");
    manager.finish(&rolled_back);

    let stats = manager.stats();
    assert_eq!(stats.active, 0);
    assert_eq!(stats.committed, 1);
    assert_eq!(stats.rolled_back, 1);
    assert_eq!(stats.failed, 0);

    let history = manager.history(10);
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].id, committed.id());
    assert_eq!(history[0].channels, vec![Channel::Email]);
    assert_eq!(history[1].status, TransactionStatus::RolledBack);
}

#[test]
fn pending_ledger_stays_active() {
    let manager = LedgerManager::new();
    let ledger = manager.begin();
    manager.finish(&ledger);
    assert_eq!(manager.active_count(), 1);
    assert!(manager.history(10).is_empty());
}

#[test]
fn history_limit_returns_newest() {
    let manager = LedgerManager::new();
    let mut ids = Vec::new();
    for _ in 0..5 {
        let mut ledger = manager.begin();
        ledger.fail("boom").expect("fail");
        manager.finish(&ledger);
        ids.push(ledger.id());
    }

    let recent = manager.history(2);
    assert_eq!(recent.len(), 2);
    assert_eq!(recent[0].id, ids[3]);
    assert_eq!(recent[1].id, ids[4]);
    assert_eq!(recent[1].error.as_deref(), Some("boom"));
}

#[test]
fn prune_stale_drops_old_in_flight_ledgers() {
    let manager = LedgerManager::new();
    let _ledger = manager.begin();
    let later = chrono::Utc::now() + chrono::Duration::minutes(10);

    assert_eq!(manager.prune_stale(chrono::Duration::minutes(30), later), 0);
    assert_eq!(manager.prune_stale(chrono::Duration::minutes(5), later), 1);
    assert_eq!(manager.active_count(), 0);
}

#[test]
fn reset_clears_counters_and_history() {
    let manager = LedgerManager::new();
    let mut ledger = manager.begin();
    ledger.commit().expect("commit");
    manager.finish(&ledger);
    let _open = manager.begin();

    manager.reset();

    assert_eq!(manager.stats(), LedgerStats::default());
    assert!(manager.history(10).is_empty());
}

// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tests for the advisory lock service.

mod common;

use std::time::Duration;

use common::{get_test_pool, unique};
use conveyor_db::lock::LockFactory;

#[tokio::test]
async fn test_mutual_exclusion() {
    skip_if_no_db!();
    let Some(pool) = get_test_pool().await else {
        eprintln!("Skipping test: could not connect to database");
        return;
    };

    let factory = LockFactory::new(pool.clone());
    let name = unique("lock");

    let held = factory.try_acquire(&name).await.unwrap();
    assert!(held.is_some());

    // Second acquisition, same process: still refused.
    let contender = factory.try_acquire(&name).await.unwrap();
    assert!(contender.is_none());

    held.unwrap().release().await.unwrap();
}

#[tokio::test]
async fn test_release_frees_the_name() {
    skip_if_no_db!();
    let Some(pool) = get_test_pool().await else {
        eprintln!("Skipping test: could not connect to database");
        return;
    };

    let factory = LockFactory::new(pool.clone());
    let name = unique("lock");

    let lock = factory.try_acquire(&name).await.unwrap().unwrap();
    lock.release().await.unwrap();

    let reacquired = factory.try_acquire(&name).await.unwrap();
    assert!(reacquired.is_some());
    reacquired.unwrap().release().await.unwrap();
}

#[tokio::test]
async fn test_distinct_names_do_not_contend() {
    skip_if_no_db!();
    let Some(pool) = get_test_pool().await else {
        eprintln!("Skipping test: could not connect to database");
        return;
    };

    let factory = LockFactory::new(pool.clone());

    let first = factory.try_acquire(&unique("lock")).await.unwrap().unwrap();
    let second = factory.try_acquire(&unique("lock")).await.unwrap().unwrap();

    first.release().await.unwrap();
    second.release().await.unwrap();
}

#[tokio::test]
async fn test_dropped_lock_is_freed_by_session_teardown() {
    skip_if_no_db!();
    let Some(pool) = get_test_pool().await else {
        eprintln!("Skipping test: could not connect to database");
        return;
    };

    let factory = LockFactory::new(pool.clone());
    let name = unique("lock");

    let lock = factory.try_acquire(&name).await.unwrap().unwrap();
    drop(lock);

    // Dropping closes the holding session in the background; poll until
    // the backend frees the lock.
    let mut reacquired = None;
    for _ in 0..50 {
        if let Some(lock) = factory.try_acquire(&name).await.unwrap() {
            reacquired = Some(lock);
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let lock = reacquired.expect("lock should be freed after drop");
    lock.release().await.unwrap();
}

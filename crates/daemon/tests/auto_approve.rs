//! Automatic approval across branches

mod common;

use common::*;
use vrt_common::store::*;
use vrt_common::{Project, TestRun, TestStatus};
use vrt_daemon::{AutoApproveEngine, TestRunService};

async fn approve_on(h: &Harness, project: &Project, branch: &str, image: Vec<u8>) -> TestRun {
    let service = TestRunService::new(h.state.clone());
    let build = h.build(project, branch).await;
    let run = service
        .post_test_run(request(project, build, branch, image))
        .await
        .unwrap();
    service.approve(run.id, false, false, None).await.unwrap()
}

#[tokio::test]
async fn test_past_baseline_match_is_auto_approved() {
    let h = Harness::new().await;
    let project = h.project(Project::new("web").with_main_branch("main").with_auto_approve(true));

    approve_on(&h, &project, "main", solid(WHITE)).await;
    approve_on(&h, &project, "main", solid(BLACK)).await;

    let main = h
        .db
        .find_variation(project.id, &identity(), "main")
        .unwrap()
        .unwrap();
    assert_eq!(h.db.list_baselines(main.id).unwrap().len(), 2);

    // develop still expects the old main image
    let build = h.build(&project, "develop").await;
    let run = TestRunService::new(h.state.clone())
        .post_test_run(request(&project, build, "develop", solid(WHITE)))
        .await
        .unwrap();

    assert_eq!(run.status, TestStatus::AutoApproved);
    assert_eq!(run.test_variation_id, Some(main.id));

    // Main's baseline is untouched and no branch variation appears
    let main_after = h.db.get_variation(main.id).unwrap().unwrap();
    assert_eq!(main_after.baseline_name, main.baseline_name);
    assert_eq!(h.db.list_baselines(main.id).unwrap().len(), 2);
    assert!(h
        .db
        .find_variation(project.id, &identity(), "develop")
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_first_establishment_on_branch_is_manual() {
    let h = Harness::new().await;
    let project = h.project(Project::new("web").with_main_branch("main").with_auto_approve(true));

    approve_on(&h, &project, "main", solid(WHITE)).await;

    let service = TestRunService::new(h.state.clone());
    let build = h.build(&project, "develop").await;
    let run = service
        .post_test_run(request(&project, build, "develop", solid(BLACK)))
        .await
        .unwrap();
    assert_eq!(run.status, TestStatus::Unresolved);

    let approved = service.approve(run.id, false, false, None).await.unwrap();
    assert_eq!(approved.status, TestStatus::Approved);
    let develop = h
        .db
        .find_variation(project.id, &identity(), "develop")
        .unwrap()
        .unwrap();
    assert_eq!(approved.test_variation_id, Some(develop.id));
    assert_eq!(h.db.list_baselines(develop.id).unwrap().len(), 1);
}

#[tokio::test]
async fn test_sibling_branch_approval_is_reused() {
    let h = Harness::new().await;
    let project = h.project(Project::new("web").with_main_branch("main").with_auto_approve(true));

    approve_on(&h, &project, "main", solid(WHITE)).await;
    let sibling = approve_on(&h, &project, "feature-a", solid(BLACK)).await;
    assert_eq!(sibling.status, TestStatus::Approved);

    let build = h.build(&project, "feature-b").await;
    let run = TestRunService::new(h.state.clone())
        .post_test_run(request(&project, build, "feature-b", solid(BLACK)))
        .await
        .unwrap();

    assert_eq!(run.status, TestStatus::AutoApproved);
    assert!(h
        .db
        .find_variation(project.id, &identity(), "feature-b")
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_unrelated_image_stays_unresolved() {
    let h = Harness::new().await;
    let project = h.project(Project::new("web").with_main_branch("main").with_auto_approve(true));

    approve_on(&h, &project, "main", solid(WHITE)).await;
    approve_on(&h, &project, "main", solid(BLACK)).await;
    approve_on(&h, &project, "feature-a", solid(RED)).await;

    let build = h.build(&project, "feature-b").await;
    let run = TestRunService::new(h.state.clone())
        .post_test_run(request(&project, build, "feature-b", white_with_corner()))
        .await
        .unwrap();
    assert_eq!(run.status, TestStatus::Unresolved);
}

#[tokio::test]
async fn test_disabled_project_never_auto_approves() {
    let h = Harness::new().await;
    let project = h.project(Project::new("web").with_main_branch("main"));

    approve_on(&h, &project, "main", solid(WHITE)).await;
    approve_on(&h, &project, "main", solid(BLACK)).await;

    let build = h.build(&project, "develop").await;
    let run = TestRunService::new(h.state.clone())
        .post_test_run(request(&project, build, "develop", solid(WHITE)))
        .await
        .unwrap();
    assert_eq!(run.status, TestStatus::Unresolved);

    // Calling the engine directly respects the flag too
    let after = AutoApproveEngine::new(h.state.clone())
        .apply(&project, run.clone())
        .await
        .unwrap();
    assert_eq!(after.status, TestStatus::Unresolved);
}

#[tokio::test]
async fn test_ok_run_is_left_alone() {
    let h = Harness::new().await;
    let project = h.project(Project::new("web").with_main_branch("main").with_auto_approve(true));

    approve_on(&h, &project, "main", solid(BLACK)).await;
    approve_on(&h, &project, "main", solid(WHITE)).await;

    let build = h.build(&project, "develop").await;
    let run = TestRunService::new(h.state.clone())
        .post_test_run(request(&project, build, "develop", solid(WHITE)))
        .await
        .unwrap();
    assert_eq!(run.status, TestStatus::Ok);

    let engine = AutoApproveEngine::new(h.state.clone());
    let after = engine.by_past_baselines(&project, run.clone()).await.unwrap();
    assert_eq!(after.status, TestStatus::Ok);
    let after = engine.by_new_baselines(&project, after).await.unwrap();
    assert_eq!(after.status, TestStatus::Ok);
    assert_eq!(after.updated_at, run.updated_at);
}

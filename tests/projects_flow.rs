mod common;

use chrono::NaiveDate;
use common::{conn, user};
use erp::auth::Role;
use erp::error::AppError;
use erp::projects::{
    self, MemberRole, NewDocument, NewTask, ProjectFilter, ProjectInput, ProjectStatus, TaskStatus,
};

fn input(name: &str) -> ProjectInput {
    ProjectInput {
        name: name.to_string(),
        description: "Internal work".to_string(),
        start_date: NaiveDate::from_ymd_opt(2024, 1, 1),
        end_date: NaiveDate::from_ymd_opt(2024, 6, 30),
        owner_id: None,
    }
}

fn task(title: &str, phase_id: Option<i64>, assignee_id: Option<i64>) -> NewTask {
    NewTask {
        title: title.to_string(),
        phase_id,
        assignee_id,
        due_date: None,
    }
}

#[test]
fn creating_a_project_assigns_a_code_and_lead() {
    let conn = conn();
    let boss = user(&conn, "boss", Role::Manager, 0);

    let first = projects::create_project(&conn, &boss, &input("Website")).unwrap();
    let second = projects::create_project(&conn, &boss, &input("Warehouse")).unwrap();
    let a = projects::get_project(&conn, first).unwrap();
    let b = projects::get_project(&conn, second).unwrap();

    assert!(a.code.starts_with("PRJ-") && a.code.ends_with("-001"));
    assert!(b.code.ends_with("-002"));
    assert_eq!(a.status, ProjectStatus::Draft);
    assert_eq!(a.owner_id, boss.id);

    let members = projects::members_for(&conn, first).unwrap();
    assert_eq!(members.len(), 1);
    assert_eq!(members[0].role, MemberRole::Lead);
}

#[test]
fn end_date_before_start_is_rejected() {
    let conn = conn();
    let boss = user(&conn, "boss", Role::Manager, 0);
    let mut bad = input("Backwards");
    bad.end_date = NaiveDate::from_ymd_opt(2023, 12, 31);

    let err = projects::create_project(&conn, &boss, &bad).unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));
}

#[test]
fn a_new_owner_must_be_an_active_user() {
    let conn = conn();
    let boss = user(&conn, "boss", Role::Manager, 0);
    let gone = user(&conn, "gone", Role::Manager, 0);
    conn.execute("UPDATE users SET status = 'inactive' WHERE id = ?1", [gone.id])
        .unwrap();
    let id = projects::create_project(&conn, &boss, &input("Website")).unwrap();

    let mut missing = input("Website");
    missing.owner_id = Some(9_999);
    let err = projects::update_project(&conn, &boss, id, &missing).unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));

    let mut inactive = input("Website");
    inactive.owner_id = Some(gone.id);
    let err = projects::update_project(&conn, &boss, id, &inactive).unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));

    let project = projects::get_project(&conn, id).unwrap();
    assert_eq!(project.owner_id, boss.id);
    assert_eq!(projects::members_for(&conn, id).unwrap().len(), 1);
}

#[test]
fn employees_cannot_create_projects() {
    let conn = conn();
    let ann = user(&conn, "ann", Role::Employee, 0);
    let err = projects::create_project(&conn, &ann, &input("Side project")).unwrap_err();
    assert!(matches!(err, AppError::Forbidden));
}

#[test]
fn progress_rolls_up_from_tasks() {
    let conn = conn();
    let boss = user(&conn, "boss", Role::Manager, 0);
    let ann = user(&conn, "ann", Role::Employee, 0);
    let id = projects::create_project(&conn, &boss, &input("Website")).unwrap();
    projects::add_member(&conn, &boss, id, ann.id, MemberRole::Member).unwrap();

    let design = projects::add_phase(&conn, &boss, id, "Design").unwrap();
    let build = projects::add_phase(&conn, &boss, id, "Build").unwrap();
    let t1 = projects::add_task(&conn, &boss, id, &task("Wireframes", Some(design), Some(ann.id))).unwrap();
    projects::add_task(&conn, &boss, id, &task("Mockups", Some(design), None)).unwrap();
    projects::add_task(&conn, &boss, id, &task("Backend", Some(build), None)).unwrap();

    // The assignee may move their own task
    projects::set_task_status(&conn, &ann, id, t1, TaskStatus::Done).unwrap();

    let project = projects::get_project(&conn, id).unwrap();
    assert_eq!(project.progress, 33);
    assert_eq!(project.done_count, 1);
    assert_eq!(project.task_count, 3);

    let phases = projects::phases_for(&conn, id).unwrap();
    let design_phase = phases.iter().find(|p| p.id == design).unwrap();
    let build_phase = phases.iter().find(|p| p.id == build).unwrap();
    assert_eq!(design_phase.progress, 50);
    assert_eq!(build_phase.progress, 0);

    let done = projects::tasks_for(&conn, id)
        .unwrap()
        .into_iter()
        .find(|t| t.id == t1)
        .unwrap();
    assert!(done.completed_at.is_some());

    projects::delete_phase(&conn, &boss, id, build).unwrap();
    let remaining = projects::tasks_for(&conn, id).unwrap();
    assert_eq!(remaining.len(), 3);
    assert!(remaining.iter().any(|t| t.title == "Backend" && t.phase_id.is_none()));
}

#[test]
fn only_members_can_be_assigned_and_non_assignees_cannot_move_tasks() {
    let conn = conn();
    let boss = user(&conn, "boss", Role::Manager, 0);
    let ann = user(&conn, "ann", Role::Employee, 0);
    let bob = user(&conn, "bob", Role::Employee, 0);
    let id = projects::create_project(&conn, &boss, &input("Website")).unwrap();

    let err = projects::add_task(&conn, &boss, id, &task("Copy", None, Some(ann.id))).unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));

    projects::add_member(&conn, &boss, id, ann.id, MemberRole::Member).unwrap();
    let t = projects::add_task(&conn, &boss, id, &task("Copy", None, Some(ann.id))).unwrap();

    let err = projects::set_task_status(&conn, &bob, id, t, TaskStatus::Done).unwrap_err();
    assert!(matches!(err, AppError::Forbidden));
}

#[test]
fn removing_a_member_unassigns_their_tasks_but_the_owner_stays() {
    let conn = conn();
    let boss = user(&conn, "boss", Role::Manager, 0);
    let ann = user(&conn, "ann", Role::Employee, 0);
    let id = projects::create_project(&conn, &boss, &input("Website")).unwrap();
    projects::add_member(&conn, &boss, id, ann.id, MemberRole::Member).unwrap();
    let t = projects::add_task(&conn, &boss, id, &task("Copy", None, Some(ann.id))).unwrap();

    projects::remove_member(&conn, &boss, id, ann.id).unwrap();
    let copy = projects::tasks_for(&conn, id)
        .unwrap()
        .into_iter()
        .find(|task| task.id == t)
        .unwrap();
    assert_eq!(copy.assignee_id, None);

    let err = projects::remove_member(&conn, &boss, id, boss.id).unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));
    let err = projects::add_member(&conn, &boss, id, boss.id, MemberRole::Viewer).unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));
}

#[test]
fn status_moves_follow_the_transition_table_and_archive_freezes() {
    let conn = conn();
    let boss = user(&conn, "boss", Role::Manager, 0);
    let id = projects::create_project(&conn, &boss, &input("Website")).unwrap();

    let err = projects::change_status(&conn, &boss, id, ProjectStatus::Completed).unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));

    projects::change_status(&conn, &boss, id, ProjectStatus::Active).unwrap();
    projects::change_status(&conn, &boss, id, ProjectStatus::OnHold).unwrap();
    projects::change_status(&conn, &boss, id, ProjectStatus::Archived).unwrap();

    let err = projects::add_phase(&conn, &boss, id, "Late phase").unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));
    let err = projects::change_status(&conn, &boss, id, ProjectStatus::Active).unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));
}

#[test]
fn list_filters_by_membership_and_text() {
    let conn = conn();
    let boss = user(&conn, "boss", Role::Manager, 0);
    let ann = user(&conn, "ann", Role::Employee, 0);
    let site = projects::create_project(&conn, &boss, &input("Website 100%")).unwrap();
    projects::create_project(&conn, &boss, &input("Warehouse")).unwrap();
    projects::add_member(&conn, &boss, site, ann.id, MemberRole::Viewer).unwrap();

    let mine = projects::list_projects(
        &conn,
        &ann,
        &ProjectFilter {
            member_of: Some(ann.id),
            ..ProjectFilter::default()
        },
    )
    .unwrap();
    assert_eq!(mine.len(), 1);
    assert_eq!(mine[0].id, site);

    let all = projects::list_projects(&conn, &ann, &ProjectFilter::default()).unwrap();
    assert_eq!(all.len(), 2);

    // `%` is matched literally
    let literal = projects::list_projects(
        &conn,
        &ann,
        &ProjectFilter {
            q: Some("100%".to_string()),
            ..ProjectFilter::default()
        },
    )
    .unwrap();
    assert_eq!(literal.len(), 1);
}

#[test]
fn viewers_cannot_upload_documents() {
    let conn = conn();
    let boss = user(&conn, "boss", Role::Manager, 0);
    let ann = user(&conn, "ann", Role::Employee, 0);
    let bob = user(&conn, "bob", Role::Employee, 0);
    let id = projects::create_project(&conn, &boss, &input("Website")).unwrap();
    projects::add_member(&conn, &boss, id, ann.id, MemberRole::Member).unwrap();
    projects::add_member(&conn, &boss, id, bob.id, MemberRole::Viewer).unwrap();

    let doc = NewDocument {
        file_name: "brief.pdf".to_string(),
        stored_name: "0f8e7a4c".to_string(),
        content_type: "application/pdf".to_string(),
        size_bytes: 1024,
    };
    let doc_id = projects::add_document(&conn, &ann, id, &doc).unwrap();
    let err = projects::add_document(&conn, &bob, id, &doc).unwrap_err();
    assert!(matches!(err, AppError::Forbidden));

    let err = projects::delete_document(&conn, &bob, id, doc_id).unwrap_err();
    assert!(matches!(err, AppError::Forbidden));
    let removed = projects::delete_document(&conn, &ann, id, doc_id).unwrap();
    assert_eq!(removed.stored_name, "0f8e7a4c");
    assert!(projects::documents_for(&conn, id).unwrap().is_empty());
}

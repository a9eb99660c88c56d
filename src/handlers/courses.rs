use axum::{
    extract::{Path, State},
    routing::get,
    Json, Router,
};
use sea_orm::{ColumnTrait, EntityTrait, QueryFilter, QueryOrder};
use uuid::Uuid;

use crate::{
    entities::{course, Course, CourseModel},
    errors::ServiceError,
    AppState,
};

/// Creates the router for the course catalog
pub fn courses_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_courses))
        .route("/{id}", get(get_course))
}

/// List published courses
#[utoipa::path(
    get,
    path = "/api/v1/courses",
    responses((status = 200, description = "Published courses")),
    tag = "Courses"
)]
pub async fn list_courses(
    State(state): State<AppState>,
) -> Result<Json<Vec<CourseModel>>, ServiceError> {
    let courses = Course::find()
        .filter(course::Column::Published.eq(true))
        .order_by_asc(course::Column::Title)
        .all(&*state.db)
        .await?;

    Ok(Json(courses))
}

/// Fetch one published course
#[utoipa::path(
    get,
    path = "/api/v1/courses/{id}",
    params(("id" = Uuid, Path, description = "Course id")),
    responses(
        (status = 200, description = "Course"),
        (status = 404, description = "Unknown or unpublished course", body = crate::errors::ErrorResponse)
    ),
    tag = "Courses"
)]
pub async fn get_course(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<CourseModel>, ServiceError> {
    let course = Course::find_by_id(id)
        .filter(course::Column::Published.eq(true))
        .one(&*state.db)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("Course {} not found", id)))?;

    Ok(Json(course))
}

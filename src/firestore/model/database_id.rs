use crate::app::FirebaseApp;
use crate::firestore::constants::DEFAULT_DATABASE_ID;
use crate::firestore::error::{missing_project_id, FirestoreResult};

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DatabaseId {
    project_id: String,
    database: String,
}

impl DatabaseId {
    pub fn new(project_id: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            database: database.into(),
        }
    }

    pub fn default(project_id: impl Into<String>) -> Self {
        Self::new(project_id, DEFAULT_DATABASE_ID)
    }

    pub fn from_app(app: &FirebaseApp) -> FirestoreResult<Self> {
        let options = app.options();
        let project_id = options.project_id.clone().ok_or_else(missing_project_id)?;
        Ok(Self::default(project_id))
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn with_database(&self, database: impl Into<String>) -> Self {
        Self::new(self.project_id.clone(), database)
    }

    pub fn is_default_database(&self) -> bool {
        self.database == DEFAULT_DATABASE_ID
    }

    /// `projects/{project}/databases/{database}`
    pub fn canonical_name(&self) -> String {
        format!("projects/{}/databases/{}", self.project_id, self.database)
    }

    /// Resource name prefix shared by every document in this database.
    pub fn documents_root(&self) -> String {
        format!("{}/documents", self.canonical_name())
    }
}

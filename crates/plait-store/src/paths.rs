use std::path::{Path, PathBuf};

/// Filesystem layout: one directory tree per plan under an
/// organization-scoped root. Subdirectory names are an implementation
/// convention, not a contract surface.
///
/// ```text
/// <root>/orgs/<org>/plans/<plan>/
///   repo/                      git-backed working copy
///   context/                   context cache
///   branches/<branch>/convo/   conversation artifacts
///   branches/<branch>/builds/  build artifacts
///   branches.json              branch metadata records
/// ```
#[derive(Debug, Clone)]
pub struct StorePaths {
    root: PathBuf,
}

impl StorePaths {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn org_dir(&self, org_id: &str) -> PathBuf {
        self.root.join("orgs").join(org_id)
    }

    pub fn plan_dir(&self, org_id: &str, plan_id: &str) -> PathBuf {
        self.org_dir(org_id).join("plans").join(plan_id)
    }

    pub fn repo_dir(&self, org_id: &str, plan_id: &str) -> PathBuf {
        self.plan_dir(org_id, plan_id).join("repo")
    }

    pub fn context_dir(&self, org_id: &str, plan_id: &str) -> PathBuf {
        self.plan_dir(org_id, plan_id).join("context")
    }

    pub fn branch_dir(&self, org_id: &str, plan_id: &str, branch: &str) -> PathBuf {
        self.plan_dir(org_id, plan_id).join("branches").join(branch)
    }

    pub fn branch_convo_dir(&self, org_id: &str, plan_id: &str, branch: &str) -> PathBuf {
        self.branch_dir(org_id, plan_id, branch).join("convo")
    }

    pub fn branch_builds_dir(&self, org_id: &str, plan_id: &str, branch: &str) -> PathBuf {
        self.branch_dir(org_id, plan_id, branch).join("builds")
    }

    pub fn branches_file(&self, org_id: &str, plan_id: &str) -> PathBuf {
        self.plan_dir(org_id, plan_id).join("branches.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_is_org_scoped() {
        let paths = StorePaths::new("/data/plait");
        assert_eq!(
            paths.repo_dir("org1", "plan1"),
            PathBuf::from("/data/plait/orgs/org1/plans/plan1/repo")
        );
        assert_eq!(
            paths.branch_convo_dir("org1", "plan1", "main"),
            PathBuf::from("/data/plait/orgs/org1/plans/plan1/branches/main/convo")
        );
    }
}

use async_trait::async_trait;
use tracing::info;

use crate::commands::{Command, CommandError, Handler, State, UserHandler};
use crate::db::{StoreError, User};
use crate::ingest::Ingestor;
use crate::scheduler::{parse_interval, Scheduler};

const DEFAULT_BROWSE_LIMIT: i64 = 2;

pub struct Login;

#[async_trait]
impl Handler for Login {
    async fn run(&self, state: &mut State, cmd: &Command) -> Result<(), CommandError> {
        let name = cmd.arg(0, "username")?;
        state.db.get_user_by_name(name).await?;
        state.config.set_user(name)?;
        println!("Logged in as {}", name);
        Ok(())
    }
}

pub struct Register;

#[async_trait]
impl Handler for Register {
    async fn run(&self, state: &mut State, cmd: &Command) -> Result<(), CommandError> {
        let name = cmd.arg(0, "username")?;
        let user = match state.db.create_user(name).await {
            Ok(user) => user,
            Err(StoreError::DuplicateKey) => {
                return Err(CommandError::AlreadyExists(format!("user '{}'", name)))
            }
            Err(e) => return Err(e.into()),
        };
        state.config.set_user(&user.name)?;
        info!("Registered user {} ({})", user.name, user.id);
        println!("User '{}' registered", user.name);
        Ok(())
    }
}

pub struct Reset;

#[async_trait]
impl Handler for Reset {
    async fn run(&self, state: &mut State, _cmd: &Command) -> Result<(), CommandError> {
        let deleted = state.db.delete_all_users().await?;
        println!("Deleted {} users", deleted);
        Ok(())
    }
}

pub struct Users;

#[async_trait]
impl Handler for Users {
    async fn run(&self, state: &mut State, _cmd: &Command) -> Result<(), CommandError> {
        let current = state.config.current_user_name.as_deref();
        for user in state.db.list_users().await? {
            if Some(user.name.as_str()) == current {
                println!("* {} (current)", user.name);
            } else {
                println!("* {}", user.name);
            }
        }
        Ok(())
    }
}

/// Collect feeds forever at a fixed interval.
pub struct Agg;

#[async_trait]
impl Handler for Agg {
    async fn run(&self, state: &mut State, cmd: &Command) -> Result<(), CommandError> {
        let raw = cmd.arg(0, "time_between_reqs")?;
        let period = parse_interval(raw).map_err(|e| CommandError::Config(format!("agg: {}", e)))?;

        let ingestor = Ingestor::new(state.db.clone(), state.fetcher.clone());
        let scheduler = Scheduler::new(ingestor, period)
            .map_err(|e| CommandError::Config(format!("agg: {}", e)))?;
        scheduler.run(state.shutdown.clone()).await;
        Ok(())
    }
}

pub struct Feeds;

#[async_trait]
impl Handler for Feeds {
    async fn run(&self, state: &mut State, _cmd: &Command) -> Result<(), CommandError> {
        for feed in state.db.list_feeds_with_owner_names().await? {
            println!("Name: {}, URL: {}, User: {}", feed.name, feed.url, feed.user_name);
        }
        Ok(())
    }
}

/// Create a feed and follow it as its creator.
pub struct AddFeed;

#[async_trait]
impl UserHandler for AddFeed {
    async fn run(&self, state: &mut State, cmd: &Command, user: User) -> Result<(), CommandError> {
        let name = cmd.arg(0, "name")?;
        let url = cmd.arg(1, "url")?;

        let (feed, _) = match state.db.create_feed_with_follow(name, url, user.id).await {
            Ok(created) => created,
            Err(StoreError::DuplicateKey) => {
                return Err(CommandError::AlreadyExists(format!("feed '{}'", url)))
            }
            Err(e) => return Err(e.into()),
        };

        println!("Added and followed '{}' ({})", feed.name, feed.url);
        Ok(())
    }
}

pub struct Follow;

#[async_trait]
impl UserHandler for Follow {
    async fn run(&self, state: &mut State, cmd: &Command, user: User) -> Result<(), CommandError> {
        let url = cmd.arg(0, "url")?;
        let feed = state.db.get_feed_by_url(url).await?;

        let follow = match state.db.create_feed_follow(user.id, feed.id).await {
            Ok(follow) => follow,
            Err(StoreError::DuplicateKey) => {
                return Err(CommandError::AlreadyExists(format!("follow of '{}'", url)))
            }
            Err(e) => return Err(e.into()),
        };

        println!("{} now follows {}", follow.user_name, follow.feed_name);
        Ok(())
    }
}

pub struct Following;

#[async_trait]
impl UserHandler for Following {
    async fn run(&self, state: &mut State, _cmd: &Command, user: User) -> Result<(), CommandError> {
        for follow in state.db.list_follows_for_user(user.id).await? {
            println!("* {}", follow.feed_name);
        }
        Ok(())
    }
}

pub struct Unfollow;

#[async_trait]
impl UserHandler for Unfollow {
    async fn run(&self, state: &mut State, cmd: &Command, user: User) -> Result<(), CommandError> {
        let url = cmd.arg(0, "url")?;
        state.db.delete_feed_follow(user.id, url).await?;
        println!("Unfollowed {}", url);
        Ok(())
    }
}

pub struct Browse;

#[async_trait]
impl UserHandler for Browse {
    async fn run(&self, state: &mut State, cmd: &Command, user: User) -> Result<(), CommandError> {
        let limit = match cmd.args.first() {
            Some(raw) => parse_limit(raw)?,
            None => DEFAULT_BROWSE_LIMIT,
        };

        for post in state.db.list_posts_for_user(user.id, limit).await? {
            println!("Title: {}", post.title);
            println!("URL: {}", post.url);
            println!("Published: {}", post.published_at.to_rfc2822());
            if let Some(description) = &post.description {
                println!("{}", description);
            }
            println!();
        }
        Ok(())
    }
}

fn parse_limit(raw: &str) -> Result<i64, CommandError> {
    match raw.parse::<i64>() {
        Ok(limit) if limit > 0 => Ok(limit),
        _ => Err(CommandError::Config(format!(
            "browse: invalid limit '{}', expected a positive number",
            raw
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::registry;
    use crate::config::Config;
    use crate::db::Database;
    use crate::fetcher::Fetcher;
    use std::sync::Arc;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    async fn create_test_state() -> (State, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::read_from(dir.path().join("gator.toml")).unwrap();
        let db = Database::new("sqlite::memory:").await.unwrap();
        db.initialize().await.unwrap();
        let state = State {
            db: Arc::new(db),
            config,
            fetcher: Fetcher::new().unwrap(),
            shutdown: CancellationToken::new(),
        };
        (state, dir)
    }

    async fn run(state: &mut State, name: &str, args: &[&str]) -> Result<(), CommandError> {
        let args = args.iter().map(|a| a.to_string()).collect();
        registry().run(state, &Command::new(name, args)).await
    }

    mod user_commands {
        use super::*;

        #[tokio::test]
        async fn test_register_sets_current_user() {
            let (mut state, _dir) = create_test_state().await;

            run(&mut state, "register", &["kahya"]).await.unwrap();

            assert_eq!(state.config.current_user_name.as_deref(), Some("kahya"));
            let reloaded = Config::read_from(state.config.path()).unwrap();
            assert_eq!(reloaded.current_user_name.as_deref(), Some("kahya"));
        }

        #[tokio::test]
        async fn test_register_twice() {
            let (mut state, _dir) = create_test_state().await;
            run(&mut state, "register", &["kahya"]).await.unwrap();

            let result = run(&mut state, "register", &["kahya"]).await;
            assert!(matches!(result, Err(CommandError::AlreadyExists(_))));
        }

        #[tokio::test]
        async fn test_register_requires_name() {
            let (mut state, _dir) = create_test_state().await;
            let result = run(&mut state, "register", &[]).await;
            assert!(matches!(result, Err(CommandError::Config(_))));
        }

        #[tokio::test]
        async fn test_login_unknown_user() {
            let (mut state, _dir) = create_test_state().await;
            let result = run(&mut state, "login", &["nobody"]).await;
            assert!(matches!(result, Err(CommandError::NotFound(_))));
            assert!(state.config.current_user_name.is_none());
        }

        #[tokio::test]
        async fn test_login_switches_user() {
            let (mut state, _dir) = create_test_state().await;
            run(&mut state, "register", &["first"]).await.unwrap();
            run(&mut state, "register", &["second"]).await.unwrap();

            run(&mut state, "login", &["first"]).await.unwrap();
            assert_eq!(state.config.current_user_name.as_deref(), Some("first"));
        }

        #[tokio::test]
        async fn test_reset_then_commands_are_unauthenticated() {
            let (mut state, _dir) = create_test_state().await;
            run(&mut state, "register", &["kahya"]).await.unwrap();
            run(&mut state, "reset", &[]).await.unwrap();

            run(&mut state, "users", &[]).await.unwrap();
            let result = run(&mut state, "following", &[]).await;
            assert!(matches!(result, Err(CommandError::Unauthenticated(_))));
        }
    }

    mod feed_commands {
        use super::*;

        async fn logged_in_state() -> (State, TempDir) {
            let (mut state, dir) = create_test_state().await;
            run(&mut state, "register", &["kahya"]).await.unwrap();
            (state, dir)
        }

        #[tokio::test]
        async fn test_addfeed_auto_follows() {
            let (mut state, _dir) = logged_in_state().await;

            run(&mut state, "addfeed", &["Blog", "https://blog.example.com/rss"])
                .await
                .unwrap();

            let user = state.db.get_user_by_name("kahya").await.unwrap();
            let follows = state.db.list_follows_for_user(user.id).await.unwrap();
            assert_eq!(follows.len(), 1);
            assert_eq!(follows[0].feed_name, "Blog");
            run(&mut state, "feeds", &[]).await.unwrap();
        }

        #[tokio::test]
        async fn test_addfeed_requires_url() {
            let (mut state, _dir) = logged_in_state().await;
            let result = run(&mut state, "addfeed", &["Blog"]).await;
            assert!(matches!(result, Err(CommandError::Config(_))));
        }

        #[tokio::test]
        async fn test_addfeed_duplicate_url() {
            let (mut state, _dir) = logged_in_state().await;
            run(&mut state, "addfeed", &["Blog", "https://blog.example.com/rss"])
                .await
                .unwrap();

            let result = run(&mut state, "addfeed", &["Again", "https://blog.example.com/rss"]).await;
            assert!(matches!(result, Err(CommandError::AlreadyExists(_))));
        }

        #[tokio::test]
        async fn test_follow_and_unfollow() {
            let (mut state, _dir) = logged_in_state().await;
            run(&mut state, "addfeed", &["Blog", "https://blog.example.com/rss"])
                .await
                .unwrap();
            run(&mut state, "register", &["reader"]).await.unwrap();

            run(&mut state, "follow", &["https://blog.example.com/rss"])
                .await
                .unwrap();
            let reader = state.db.get_user_by_name("reader").await.unwrap();
            assert_eq!(state.db.list_follows_for_user(reader.id).await.unwrap().len(), 1);

            let again = run(&mut state, "follow", &["https://blog.example.com/rss"]).await;
            assert!(matches!(again, Err(CommandError::AlreadyExists(_))));

            run(&mut state, "unfollow", &["https://blog.example.com/rss"])
                .await
                .unwrap();
            assert!(state.db.list_follows_for_user(reader.id).await.unwrap().is_empty());

            let missing = run(&mut state, "unfollow", &["https://blog.example.com/rss"]).await;
            assert!(matches!(missing, Err(CommandError::NotFound(_))));
        }

        #[tokio::test]
        async fn test_follow_unknown_feed() {
            let (mut state, _dir) = logged_in_state().await;
            let result = run(&mut state, "follow", &["https://nowhere.example.com/rss"]).await;
            assert!(matches!(result, Err(CommandError::NotFound(_))));
        }

        #[tokio::test]
        async fn test_browse_limits() {
            let (mut state, _dir) = logged_in_state().await;
            run(&mut state, "browse", &[]).await.unwrap();
            run(&mut state, "browse", &["5"]).await.unwrap();

            let bad = run(&mut state, "browse", &["many"]).await;
            assert!(matches!(bad, Err(CommandError::Config(_))));
            let zero = run(&mut state, "browse", &["0"]).await;
            assert!(matches!(zero, Err(CommandError::Config(_))));
        }
    }

    mod agg_command {
        use super::*;

        #[tokio::test]
        async fn test_agg_requires_interval() {
            let (mut state, _dir) = create_test_state().await;
            let result = run(&mut state, "agg", &[]).await;
            assert!(matches!(result, Err(CommandError::Config(_))));
        }

        #[tokio::test]
        async fn test_agg_rejects_bad_interval_before_looping() {
            let (mut state, _dir) = create_test_state().await;
            for raw in ["soon", "0s", "-1m"] {
                let result = run(&mut state, "agg", &[raw]).await;
                assert!(matches!(result, Err(CommandError::Config(_))), "{}", raw);
            }
        }

        #[tokio::test]
        async fn test_agg_stops_on_shutdown() {
            let (mut state, _dir) = create_test_state().await;
            state.shutdown.cancel();
            run(&mut state, "agg", &["1s"]).await.unwrap();
        }
    }

    #[test]
    fn test_parse_limit() {
        assert_eq!(parse_limit("3").unwrap(), 3);
        assert!(parse_limit("-1").is_err());
        assert!(parse_limit("x").is_err());
    }
}

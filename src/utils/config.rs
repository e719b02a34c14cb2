//! Configuration parameters struct parsing helper.

/// Composes a configuration struct from its default values, then overwrites
/// given fields by parsing from given TOML string if it's not `None`. Returns
/// an `Ok(config)` on success, and `Err(IdGenError)` on parser failure.
///
/// Example:
/// ```no_run
/// # use idgen::{parsed_config, ClientConfig, IdGenError};
/// # fn main() -> Result<(), IdGenError> {
/// # let config_str: Option<&str> = None;
/// let config = parsed_config!(config_str => ClientConfig; bucket_step)?;
/// # Ok(())
/// # }
/// ```
#[macro_export]
macro_rules! parsed_config {
    ($config_str:expr => $config_type:ty; $($field:ident),+) => {{
        let config_str: Option<&str> = $config_str;

        // closure helper for easier error returning
        let compose_config = || -> Result<$config_type, $crate::IdGenError> {
            let mut config: $config_type = Default::default();
            let config_str = match config_str {
                Some(s) => s,
                None => return Ok(config),
            };

            let mut table = config_str.parse::<toml::Table>()?;

            // traverse through all given field names
            $({
                // if field name found in table (and removed)
                if let Some(v) = table.remove(stringify!($field)) {
                    config.$field = v.try_into()?;
                }
            })+

            // if table is not empty at this time, some parsed keys are not
            // expected hence invalid
            if let Some(key) = table.keys().next() {
                return Err($crate::IdGenError::msg(format!(
                    "invalid field name '{}' in config",
                    key,
                )));
            }

            Ok(config)
        };

        compose_config()
    }};
}

#[cfg(test)]
mod config_tests {
    use crate::utils::IdGenError;

    #[derive(Debug, PartialEq)]
    struct TestConfig {
        bucket_step: i64,
        store_path: String,
        max_unactive_secs: u64,
    }

    impl Default for TestConfig {
        fn default() -> Self {
            TestConfig {
                bucket_step: 100,
                store_path: "/tmp/idgen.counter.db".into(),
                max_unactive_secs: 60,
            }
        }
    }

    #[test]
    fn parse_from_none() -> Result<(), IdGenError> {
        let config = parsed_config!(None => TestConfig;
                                    bucket_step, store_path, max_unactive_secs)?;
        let ref_config: TestConfig = Default::default();
        assert_eq!(config, ref_config);
        Ok(())
    }

    #[test]
    fn parse_from_partial() -> Result<(), IdGenError> {
        let config_str = Some("bucket_step = 1000");
        let config = parsed_config!(config_str => TestConfig;
                                    bucket_step, max_unactive_secs)?;
        let ref_config = TestConfig {
            bucket_step: 1000,
            store_path: "/tmp/idgen.counter.db".into(),
            max_unactive_secs: 60,
        };
        assert_eq!(config, ref_config);
        Ok(())
    }

    #[test]
    fn parse_invalid_field() {
        let config_str = Some("xyz = 999");
        assert!(parsed_config!(config_str => TestConfig; bucket_step).is_err());
    }

    #[test]
    fn parse_wrong_type() {
        let config_str = Some("bucket_step = 'lots'");
        assert!(parsed_config!(config_str => TestConfig; bucket_step).is_err());
    }
}

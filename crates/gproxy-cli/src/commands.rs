//! Command factory: clap commands synthesized from endpoint
//! descriptors, plus the instance-management commands.
//!
//! Argument mapping per method parameter:
//! - a required `tenant_id` becomes an optional positional resolved
//!   from the active CLI context when omitted (it is ordered last so
//!   required positionals keep their places);
//! - other required parameters become positional arguments;
//! - optional parameters become `--options` with visible defaults;
//! - booleans become paired `--flag / --no-flag` toggles.
//!
//! Every value enters as a string and goes through `invoke`'s
//! JSON-coercion and validation, exactly like the other channels.

use clap::{Arg, ArgAction, ArgMatches, Command};
use gproxy_core::{EncryptionManager, ProxyConfig, ProxyError, Record, Result};
use gproxy_entities::{
    invoke, is_available, CallerIdentity, Channel, MethodSpec, ParamType, Proxy,
};
use serde_json::Value;
use std::sync::Arc;

use crate::context::CliContext;
use crate::render::render;

/// Build the full command tree for a proxy.
pub fn build_cli(proxy: &Proxy) -> Command {
    let mut root = Command::new("gproxy")
        .about("Multi-tenant service proxy")
        .version(env!("CARGO_PKG_VERSION"))
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(
            Arg::new("instance")
                .long("instance")
                .short('i')
                .global(true)
                .help("Instance to operate on (overrides context)"),
        )
        .arg(
            Arg::new("tenant")
                .long("tenant")
                .short('t')
                .global(true)
                .help("Tenant scope (overrides context)"),
        );

    for endpoint in proxy.endpoints() {
        let mut group = Command::new(endpoint.name())
            .about(format!("Manage {}", endpoint.name()))
            .subcommand_required(true);
        let mut any = false;
        for spec in endpoint.methods() {
            if !is_available(&*endpoint, &spec, Channel::Cli) {
                continue;
            }
            group = group.subcommand(method_command(&spec));
            any = true;
        }
        if any {
            root = root.subcommand(group);
        }
    }

    root.subcommand(
        Command::new("serve")
            .about("Start a proxy server instance")
            .arg(Arg::new("name").help("Instance name"))
            .arg(Arg::new("host").long("host").help("Bind host"))
            .arg(
                Arg::new("port")
                    .long("port")
                    .short('p')
                    .help("Bind port"),
            )
            .arg(
                Arg::new("background")
                    .long("background")
                    .short('b')
                    .action(ArgAction::SetTrue)
                    .help("Start detached and return immediately"),
            ),
    )
    .subcommand(Command::new("list").about("List all instances with status"))
    .subcommand(
        Command::new("stop")
            .about("Stop running instance(s)")
            .arg(Arg::new("name").default_value("*").help("Instance name or '*'"))
            .arg(
                Arg::new("force")
                    .long("force")
                    .action(ArgAction::SetTrue)
                    .help("Use SIGKILL instead of SIGTERM"),
            ),
    )
    .subcommand(
        Command::new("restart")
            .about("Restart running instance(s)")
            .arg(Arg::new("name").default_value("*").help("Instance name or '*'"))
            .arg(
                Arg::new("force")
                    .long("force")
                    .action(ArgAction::SetTrue)
                    .help("Use SIGKILL for stopping"),
            ),
    )
    .subcommand(
        Command::new("use")
            .about("Set the default instance/tenant context")
            .arg(
                Arg::new("context")
                    .required(true)
                    .help("Context as 'instance', 'instance/tenant', or '/tenant'"),
            ),
    )
    .subcommand(Command::new("version").about("Show version information"))
}

/// Synthesize one subcommand from a method descriptor.
fn method_command(spec: &MethodSpec) -> Command {
    let mut cmd = Command::new(spec.name.replace('_', "-"));

    // Required positionals first, in declaration order.
    for param in &spec.params {
        if param.required && param.name != "tenant_id" {
            let mut arg = Arg::new(param.name).required(true);
            if let ParamType::Choice(choices) = param.ty {
                arg = arg.value_parser(clap::builder::PossibleValuesParser::new(
                    choices.iter().copied(),
                ));
            }
            cmd = cmd.arg(arg);
        }
    }

    // A required tenant_id becomes an optional trailing positional;
    // missing values resolve from the active context.
    if spec
        .params
        .iter()
        .any(|p| p.required && p.name == "tenant_id")
    {
        cmd = cmd.arg(
            Arg::new("tenant_id")
                .required(false)
                .help("Tenant (defaults to the active context)"),
        );
    }

    for param in &spec.params {
        if param.required {
            continue;
        }
        let cli_name = param.name.replace('_', "-");
        if param.ty == ParamType::Bool {
            let off_id = format!("no_{}", param.name);
            cmd = cmd
                .arg(
                    Arg::new(param.name)
                        .long(cli_name.clone())
                        .action(ArgAction::SetTrue)
                        .overrides_with(off_id.clone())
                        .help(format!("Enable {}", param.name)),
                )
                .arg(
                    Arg::new(off_id.clone())
                        .long(format!("no-{cli_name}"))
                        .action(ArgAction::SetTrue)
                        .overrides_with(param.name)
                        .help(format!("Disable {}", param.name)),
                );
        } else {
            let mut arg = Arg::new(param.name).long(cli_name);
            if let ParamType::Choice(choices) = param.ty {
                arg = arg.value_parser(clap::builder::PossibleValuesParser::new(
                    choices.iter().copied(),
                ));
            }
            if let Some(default) = &param.default {
                if !default.is_null() {
                    arg = arg.default_value(scalar_to_string(default));
                }
            }
            cmd = cmd.arg(arg);
        }
    }

    cmd
}

fn scalar_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Collect invocation parameters from parsed matches.
fn collect_params(spec: &MethodSpec, matches: &ArgMatches) -> Record {
    let mut params = Record::new();
    for param in &spec.params {
        if !param.required && param.ty == ParamType::Bool {
            let off_id = format!("no_{}", param.name);
            if matches.get_flag(&off_id) {
                params.insert(param.name.to_string(), Value::Bool(false));
            } else if matches.get_flag(param.name) {
                params.insert(param.name.to_string(), Value::Bool(true));
            }
            continue;
        }
        if let Some(value) = matches.get_one::<String>(param.name) {
            params.insert(param.name.to_string(), Value::String(value.clone()));
        }
    }
    params
}

/// Build the proxy for one configured instance.
pub fn proxy_for_instance(ctx: &CliContext, instance: &str) -> Result<Arc<Proxy>> {
    let instance_config = ctx.supervisor().read_config(instance).ok_or_else(|| {
        ProxyError::configuration(format!(
            "instance '{instance}' not found; create it with 'gproxy serve {instance}'"
        ))
    })?;

    let config = ProxyConfig {
        db: instance_config.db_path,
        instance_name: instance_config.name,
        host: instance_config.host,
        port: instance_config.port,
        api_token: instance_config.api_token,
        ..ProxyConfig::default()
    };

    Ok(Arc::new(Proxy::assemble(
        config,
        Proxy::builtin_registry(),
        EncryptionManager::from_env(),
        ctx.supervisor().clone(),
    )?))
}

/// Execute one entity subcommand against the active instance.
pub async fn run_entity_command(
    ctx: &CliContext,
    spec_proxy: &Proxy,
    entity: &str,
    matches: &ArgMatches,
) -> Result<()> {
    let (command_name, sub_matches) = matches
        .subcommand()
        .ok_or_else(|| ProxyError::configuration("missing subcommand"))?;
    let endpoint = spec_proxy.endpoint(entity)?;
    let spec = endpoint
        .methods()
        .into_iter()
        .find(|m| m.name.replace('_', "-") == command_name)
        .ok_or_else(|| {
            ProxyError::not_found(format!("method '{command_name}' not found on {entity}"))
        })?;

    let mut params = collect_params(&spec, sub_matches);

    let explicit_instance = matches.get_one::<String>("instance").map(String::as_str);
    let explicit_tenant = matches.get_one::<String>("tenant").map(String::as_str);

    // Resolve tenant_id from the context when the method requires one
    // and neither the positional nor a flag provided it.
    let needs_tenant = spec
        .params
        .iter()
        .any(|p| p.required && p.name == "tenant_id");
    if needs_tenant && !params.contains_key("tenant_id") {
        let (_, tenant) = ctx.resolve(explicit_instance, explicit_tenant);
        let tenant = tenant.ok_or_else(|| {
            ProxyError::configuration(
                "tenant required; pass it explicitly, run 'gproxy use <instance>/<tenant>', \
                 or set GPROXY_TENANT",
            )
        })?;
        params.insert("tenant_id".to_string(), Value::String(tenant));
    }

    // Table-less endpoints run against the local filesystem; the rest
    // need the instance database.
    let result = if endpoint.table().is_none() {
        invoke(&*endpoint, spec.name, params, &CallerIdentity::admin()).await?
    } else {
        let (instance, _) = ctx.require_instance(explicit_instance, explicit_tenant)?;
        let proxy = proxy_for_instance(ctx, &instance)?;
        proxy.init().await?;
        let endpoint = proxy.endpoint(entity)?;
        let result = invoke(&*endpoint, spec.name, params, &CallerIdentity::admin()).await;
        proxy.shutdown().await;
        result?
    };

    let rendered = render(&result);
    if !rendered.is_empty() {
        println!("{rendered}");
    }
    Ok(())
}

/// `gproxy serve <name>`: start an instance in the foreground or
/// detached.
pub async fn run_serve(ctx: &CliContext, matches: &ArgMatches) -> Result<()> {
    let explicit_instance = matches.get_one::<String>("instance").map(String::as_str);
    let name = matches
        .get_one::<String>("name")
        .cloned()
        .or_else(|| ctx.resolve(explicit_instance, None).0)
        .unwrap_or_else(|| "default".to_string());

    let supervisor = ctx.supervisor();
    let (running, pid, port) = supervisor.is_running(&name);
    if running {
        println!(
            "instance '{name}' already running (pid {}, port {})",
            pid.unwrap_or_default(),
            port.unwrap_or_default()
        );
        return Ok(());
    }

    let host_override = matches.get_one::<String>("host").cloned();
    let port_override = matches
        .get_one::<String>("port")
        .map(|p| {
            p.parse::<u16>()
                .map_err(|_| ProxyError::configuration(format!("invalid port: {p}")))
        })
        .transpose()?;

    let existing = supervisor.read_config(&name);
    let host = host_override
        .or_else(|| existing.as_ref().map(|c| c.host.clone()))
        .unwrap_or_else(|| "0.0.0.0".to_string());
    let port = port_override
        .or(existing.as_ref().map(|c| c.port))
        .unwrap_or(8000);
    supervisor.ensure_config(&name, &host, port)?;

    if matches.get_flag("background") {
        let pid = supervisor.spawn_background(&name, &host, port).await?;
        match pid {
            Some(pid) => println!("instance '{name}' started (pid {pid}, port {port})"),
            None => println!("instance '{name}' spawned; no PID file yet (still starting?)"),
        }
        return Ok(());
    }

    let proxy = proxy_for_instance(ctx, &name)?;
    proxy.init().await?;
    supervisor.write_pid(&name, std::process::id() as i32, port, &host)?;
    let result = gproxy_api::run_server(proxy, &host, port).await;
    // Cleanup runs on both signal-driven and normal shutdown.
    supervisor.remove_pid(&name);
    result
}

/// `gproxy list`: table of instances with status.
pub fn run_list(ctx: &CliContext) -> Result<()> {
    let instances = ctx.supervisor().list_instances();
    let value = serde_json::to_value(&instances)
        .map_err(|e| ProxyError::internal(e.to_string()))?;
    let rendered = render(&value);
    if rendered.is_empty() {
        println!("no instances configured");
    } else {
        println!("{rendered}");
    }
    Ok(())
}

/// `gproxy stop <name>`.
pub async fn run_stop(ctx: &CliContext, matches: &ArgMatches) -> Result<()> {
    let name = matches.get_one::<String>("name").cloned().unwrap_or_default();
    let force = matches.get_flag("force");
    let stopped = ctx.supervisor().stop_matching(&name, force).await;
    if stopped.is_empty() {
        println!("nothing to stop");
    } else {
        for instance in stopped {
            println!("stopped '{instance}'");
        }
    }
    Ok(())
}

/// `gproxy restart <name>`: stop, then print the respawn commands
/// (the respawn needs a fresh process).
pub async fn run_restart(ctx: &CliContext, matches: &ArgMatches) -> Result<()> {
    let name = matches.get_one::<String>("name").cloned().unwrap_or_default();
    let force = matches.get_flag("force");
    let stopped = ctx.supervisor().stop_matching(&name, force).await;
    if stopped.is_empty() {
        println!("nothing to restart");
        return Ok(());
    }
    println!("instances stopped; start them with:");
    for instance in stopped {
        println!("  gproxy serve {instance}");
    }
    Ok(())
}

/// `gproxy use <context>`.
pub fn run_use(ctx: &CliContext, matches: &ArgMatches) -> Result<()> {
    let value = matches
        .get_one::<String>("context")
        .ok_or_else(|| ProxyError::configuration("context required"))?;
    let (instance, tenant) = CliContext::parse_context(value);
    // "/tenant" keeps the current instance.
    let instance = instance.or_else(|| ctx.current().0);
    let Some(instance) = instance else {
        return Err(ProxyError::configuration(
            "no instance in context; use 'gproxy use <instance>[/<tenant>]'",
        ));
    };
    ctx.set_current(Some(&instance), tenant.as_deref())?;
    match tenant {
        Some(tenant) => println!("context set to {instance}/{tenant}"),
        None => println!("context set to {instance}"),
    }
    Ok(())
}

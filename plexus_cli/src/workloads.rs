use anyhow::{anyhow, Result};
use plexus_core::isolate::{Op, PLEXUS_MODULE};
use plexus_core::{ChannelKind, Proto, ProtoBuilder, Runtime, Value};

/// `function(input, output, rounds)`: receive a value, pass it on incremented, `rounds` times.
fn relay() -> Result<Proto> {
    let mut b = ProtoBuilder::new("relay", 3);
    let round = b.local();
    let value = b.local();
    let top = b.label();
    let done = b.label();

    b.int(1).set_local(round);
    b.place(top).get_local(round).get_local(2).op(Op::Le).jump_if_false(done);
    b.module_fn(PLEXUS_MODULE, "receive").get_local(0).call(1, 1).set_local(value);
    b.module_fn(PLEXUS_MODULE, "send")
        .get_local(1)
        .get_local(value)
        .int(1)
        .op(Op::Add)
        .call(2, 0);
    b.get_local(round).int(1).op(Op::Add).set_local(round).jump(top);
    b.place(done).ret(0);
    Ok(b.build()?)
}

fn expect_int(values: &[Value]) -> Result<i64> {
    match values {
        [Value::Int(n), ..] => Ok(*n),
        [Value::Nil, Value::Str(message), ..] => Err(anyhow!("process reported: {}", message)),
        other => Err(anyhow!("unexpected reply {:?}", other)),
    }
}

pub fn ring(runtime: &mut Runtime, processes: usize, rounds: usize) -> Result<i64> {
    let name = |i: usize| format!("ring-{}", i);
    for i in 0..=processes {
        runtime.create_channel(&name(i), ChannelKind::Sync)?;
    }
    let relay = relay()?;
    for i in 0..processes {
        let args = vec![
            Value::string(name(i)),
            Value::string(name(i + 1)),
            Value::Int(rounds as i64),
        ];
        runtime.spawn(relay.clone(), args)?;
    }
    log::debug!("spawned {} relays", processes);

    let mut counter = 0;
    for round in 0..rounds {
        runtime.send(&name(0), vec![Value::Int(counter)])?;
        counter = expect_int(&runtime.receive(&name(processes), false)?)?;
        log::trace!("round {} ended at {}", round, counter);
    }
    Ok(counter)
}

pub fn pingpong(runtime: &mut Runtime, exchanges: usize, asynchronous: bool) -> Result<()> {
    let kind = if asynchronous { ChannelKind::Async } else { ChannelKind::Sync };
    runtime.create_channel("ping", kind)?;
    runtime.create_channel("pong", kind)?;
    runtime.spawn(relay()?, vec![Value::string("ping"), Value::string("pong"), Value::Int(exchanges as i64)])?;

    for i in 0..exchanges as i64 {
        runtime.send("ping", vec![Value::Int(i)])?;
        let reply = expect_int(&runtime.receive("pong", false)?)?;
        if reply != i + 1 {
            return Err(anyhow!("exchange {} came back as {}", i, reply));
        }
    }
    Ok(())
}
